//! Debuggee emulated from a TOML program script.
//!
//! A script names its source file, declares types and lists statements executed
//! one after another:
//!
//! ```toml
//! file = "main.cs"
//! entry = "Program.Main()"
//!
//! [[types]]
//! name = "Point"
//! fields = [{ name = "X", type = "int" }, { name = "Y", type = "int" }]
//! to_string = "({X}, {Y})"
//!
//! [[statements]]
//! line = 3
//! set = { p = { new = "Point", fields = { X = 1, Y = 2 } } }
//!
//! [[statements]]
//! line = 10
//! call = { method = "Program.Draw(Point p)", args = { p = { ref = "p" } } }
//!
//! [[statements]]
//! line = 11
//! output = "drawing"
//! ret = true
//! ```
//!
//! A statement with `call` enters the method first, its line belongs to the callee.
//! A statement with `ret` leaves the current method after it is executed.
//! Types are declared before use.

use crate::adaptor::ObjectValueAdaptor;
use crate::backtrace::{Backtrace, BacktraceWrapper};
use crate::error::Error;
use crate::eval::{evaluate, EvaluationContext};
use crate::model::{
    DisplayAttribute, InvokeScope, Primitive, StackFrame, TargetException, TypeId, TypeKind, Value,
    VariableSlot, VirtualMachine,
};
use crate::server::{
    AssemblyLine, BreakEvent, BreakEventHandle, BreakEventKind, ControllerCallbacks,
    DebuggerServer, ProcessInfo, SessionOptions, StartInfo, TargetEvent, TargetEventKind,
    ThreadInfo,
};
use crate::{muted_error, rd_debug, rd_info, rd_warn, weak_error};
use indexmap::IndexMap;
use itertools::Itertools;
use once_cell::sync::{Lazy, OnceCell};
use regex::{Captures, Regex};
use serde::Deserialize;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

/// The emulated debuggee has a single thread.
pub const MAIN_THREAD: i64 = 1;
const CODE_BASE: u64 = 0x1000;
const INSTRUCTION_SIZE: u64 = 4;

#[derive(Debug, Clone, Deserialize)]
pub struct Script {
    pub file: String,
    #[serde(default = "default_entry")]
    pub entry: String,
    /// Pause between statements.
    #[serde(default)]
    pub delay_ms: u64,
    #[serde(default)]
    pub types: Vec<TypeDecl>,
    pub statements: Vec<Statement>,
}

fn default_entry() -> String {
    "Program.Main()".to_string()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeDeclKind {
    #[default]
    Class,
    Struct,
    Enum,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TypeDecl {
    pub name: String,
    #[serde(default)]
    pub kind: TypeDeclKind,
    pub base: Option<String>,
    #[serde(default)]
    pub fields: Vec<MemberDecl>,
    #[serde(default)]
    pub statics: Vec<MemberDecl>,
    /// Read-only properties, each returns the value of a field.
    #[serde(default)]
    pub properties: Vec<PropertyDecl>,
    /// Parameterless string methods, `{field}` holes are replaced by field values.
    #[serde(default)]
    pub methods: Vec<MethodDecl>,
    #[serde(default)]
    pub variants: Vec<(String, i64)>,
    pub display: Option<DisplayAttribute>,
    /// `ToString()` override, a template like the ones of `methods`.
    pub to_string: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MemberDecl {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: String,
    pub value: Option<toml::Value>,
    #[serde(default)]
    pub private: bool,
    #[serde(default)]
    pub hidden: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PropertyDecl {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: String,
    pub field: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MethodDecl {
    pub name: String,
    pub returns: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Statement {
    pub line: u32,
    pub output: Option<String>,
    pub stderr: Option<String>,
    /// Local variable assignments, applied in order.
    #[serde(default)]
    pub set: IndexMap<String, toml::Value>,
    pub call: Option<CallDecl>,
    #[serde(default)]
    pub ret: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallDecl {
    /// Signature of the entered method, like `Program.Run(int count)`.
    pub method: String,
    #[serde(default)]
    pub args: IndexMap<String, toml::Value>,
    pub this: Option<toml::Value>,
}

impl Script {
    pub fn parse(data: &str) -> Result<Self, Error> {
        let script: Script = toml::from_str(data)?;
        if script.statements.is_empty() {
            return Err(Error::InvalidScript("program has no statements".to_string()));
        }
        Ok(script)
    }

    pub fn load(path: &Path) -> Result<Self, Error> {
        Self::parse(&std::fs::read_to_string(path)?)
    }
}

/// Parsed method signature.
#[derive(Debug, Clone)]
struct MethodSig {
    label: String,
    name: String,
    declaring: TypeId,
    params: Vec<(String, TypeId)>,
}

/// Script bound to the runtime model.
struct Program {
    script: Script,
    vm: Arc<VirtualMachine>,
    adaptor: Arc<ObjectValueAdaptor>,
    entry: MethodSig,
    calls: Vec<Option<MethodSig>>,
}

impl Program {
    fn new(script: Script) -> Result<Self, Error> {
        let vm = Arc::new(VirtualMachine::new());
        for decl in &script.types {
            define_type(&vm, decl)?;
        }
        let entry = parse_signature(&vm, &script.entry)?;
        let calls = script
            .statements
            .iter()
            .map(|stmt| {
                stmt.call
                    .as_ref()
                    .map(|call| parse_signature(&vm, &call.method))
                    .transpose()
            })
            .collect::<Result<Vec<_>, Error>>()?;
        Ok(Self {
            script,
            vm,
            adaptor: Arc::new(ObjectValueAdaptor::new()),
            entry,
            calls,
        })
    }

    fn is_same_file(&self, file: &str) -> bool {
        Path::new(file).file_name() == Path::new(&self.script.file).file_name()
    }
}

fn resolve_type(vm: &VirtualMachine, name: &str) -> Result<TypeId, Error> {
    if let Some(element) = name.strip_suffix("[]") {
        return Ok(vm.array_type(resolve_type(vm, element.trim())?));
    }
    vm.find_type(name)
        .ok_or_else(|| Error::InvalidScript(format!("unknown type `{name}`")))
}

fn define_type(vm: &VirtualMachine, decl: &TypeDecl) -> Result<TypeId, Error> {
    if decl.kind == TypeDeclKind::Enum {
        let variants: Vec<_> = decl
            .variants
            .iter()
            .map(|(name, value)| (name.as_str(), *value))
            .collect();
        return Ok(vm.define_enum(&decl.name, &variants));
    }

    let mut builder = match decl.kind {
        TypeDeclKind::Struct => vm.define_struct(&decl.name),
        _ => vm.define_class(&decl.name),
    };
    if let Some(base) = &decl.base {
        builder = builder.base(resolve_type(vm, base)?);
    }
    for field in &decl.fields {
        let ty = resolve_type(vm, &field.ty)?;
        builder = match (field.hidden, field.private) {
            (true, _) => builder.hidden_field(&field.name, ty),
            (false, true) => builder.private_field(&field.name, ty),
            (false, false) => builder.field(&field.name, ty),
        };
    }
    for field in &decl.statics {
        let ty = resolve_type(vm, &field.ty)?;
        let init = match &field.value {
            Some(value) => convert_value(vm, value, None)?,
            None => vm.default_value(ty),
        };
        builder = builder.static_field(&field.name, ty, init);
    }
    for property in &decl.properties {
        let ty = resolve_type(vm, &property.ty)?;
        let field = property.field.clone();
        builder = builder.property(&property.name, ty, move |scope, this, _| {
            read_field(scope, this, &field)
        });
    }
    for method in &decl.methods {
        let template = method.returns.clone();
        builder = builder.method(&method.name, &[], TypeId::STRING, move |scope, this, _| {
            render_fields(scope, this, &template).map(Value::string)
        });
    }
    if let Some(template) = &decl.to_string {
        let template = template.clone();
        builder = builder.method("ToString", &[], TypeId::STRING, move |scope, this, _| {
            render_fields(scope, this, &template).map(Value::string)
        });
    }
    if let Some(display) = &decl.display {
        builder = builder.display(display.clone());
    }
    Ok(builder.build())
}

fn read_field(
    scope: &InvokeScope<'_>,
    this: Option<&Value>,
    name: &str,
) -> Result<Value, TargetException> {
    let this = this.ok_or_else(|| {
        TargetException::new("NullReferenceException", "instance method called without target")
    })?;
    let vm = scope.vm;
    let field = vm
        .base_chain(vm.type_of(this))
        .iter()
        .find_map(|t| t.field(name).cloned())
        .ok_or_else(|| TargetException::new("MissingFieldException", format!("no field `{name}`")))?;
    vm.get_field(Some(this), &field)
        .map_err(|e| TargetException::new("InvalidOperationException", e.to_string()))
}

/// Replace `{field}` holes of a template with plain field values.
fn render_fields(
    scope: &InvokeScope<'_>,
    this: Option<&Value>,
    template: &str,
) -> Result<String, TargetException> {
    static FIELD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{(\w+)\}").expect("must compile"));

    let mut failure = None;
    let text = FIELD_RE.replace_all(template, |caps: &Captures| {
        match read_field(scope, this, &caps[1]) {
            Ok(Value::Null) => "null".to_string(),
            Ok(Value::Primitive(p)) => p.to_string(),
            Ok(Value::String(s)) => s.to_string(),
            Ok(Value::Enum { ty, value }) => scope
                .vm
                .enum_variant(ty, value)
                .unwrap_or_else(|| value.to_string()),
            Ok(other) => scope.vm.type_name(scope.vm.type_of(&other)),
            Err(e) => {
                failure.get_or_insert(e);
                String::new()
            }
        }
    });
    match failure {
        Some(e) => Err(e),
        None => Ok(text.into_owned()),
    }
}

/// Parse `Type.Method(type name, ...)`, the declaring type is defined on demand.
fn parse_signature(vm: &VirtualMachine, signature: &str) -> Result<MethodSig, Error> {
    let invalid = || Error::InvalidScript(format!("invalid method signature `{signature}`"));
    let (name, rest) = signature.split_once('(').ok_or_else(invalid)?;
    let params = rest.strip_suffix(')').ok_or_else(invalid)?;
    let name = name.trim();
    let (type_name, _) = name.rsplit_once('.').ok_or_else(invalid)?;
    let declaring = match vm.find_type(type_name) {
        Some(ty) => ty,
        None => vm.define_class(type_name).build(),
    };

    let params = params
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| {
            let (ty, name) = p.rsplit_once(' ').ok_or_else(invalid)?;
            Ok((name.trim().to_string(), resolve_type(vm, ty.trim())?))
        })
        .collect::<Result<Vec<_>, Error>>()?;

    Ok(MethodSig {
        label: signature.trim().to_string(),
        name: name.to_string(),
        declaring,
        params,
    })
}

/// Build a runtime value from its script notation.
fn convert_value(
    vm: &VirtualMachine,
    value: &toml::Value,
    frame: Option<&FrameState>,
) -> Result<Value, Error> {
    let converted = match value {
        toml::Value::Integer(i) => match i32::try_from(*i) {
            Ok(v) => Value::int(v),
            Err(_) => Value::Primitive(Primitive::Int64(*i)),
        },
        toml::Value::Float(f) => Value::Primitive(Primitive::Double(*f)),
        toml::Value::Boolean(b) => Value::bool(*b),
        toml::Value::String(s) => Value::string(s),
        toml::Value::Datetime(d) => Value::string(d.to_string()),
        toml::Value::Array(items) => {
            let items = items
                .iter()
                .map(|item| convert_value(vm, item, frame))
                .collect::<Result<Vec<_>, Error>>()?;
            let element = items
                .iter()
                .map(|item| vm.type_of(item))
                .all_equal_value()
                .unwrap_or(TypeId::OBJECT);
            vm.new_array(element, items)
        }
        toml::Value::Table(table) => {
            let text = |key: &str| table.get(key).and_then(toml::Value::as_str);
            if table.contains_key("null") {
                Value::Null
            } else if let Some(c) = text("char") {
                let c = c
                    .chars()
                    .next()
                    .ok_or_else(|| Error::InvalidScript("empty char literal".to_string()))?;
                Value::Primitive(Primitive::Char(c))
            } else if let Some(v) = table.get("long").and_then(toml::Value::as_integer) {
                Value::Primitive(Primitive::Int64(v))
            } else if let Some(name) = text("ref") {
                frame
                    .and_then(|f| f.find(name))
                    .map(|slot| slot.get())
                    .ok_or_else(|| Error::InvalidScript(format!("unknown variable `{name}`")))?
            } else if let Some(enum_name) = text("enum") {
                let ty = resolve_type(vm, enum_name)?;
                let variant = text("value").unwrap_or_default();
                let value = match &vm.type_info(ty).kind {
                    TypeKind::Enum { variants } => variants
                        .iter()
                        .find(|(name, _)| name == variant)
                        .map(|(_, v)| *v),
                    _ => None,
                }
                .ok_or_else(|| {
                    Error::InvalidScript(format!("`{enum_name}` has no variant `{variant}`"))
                })?;
                Value::Enum { ty, value }
            } else if let Some(element) = text("array") {
                let element = resolve_type(vm, element)?;
                let items = match table.get("items") {
                    Some(toml::Value::Array(items)) => items
                        .iter()
                        .map(|item| convert_value(vm, item, frame))
                        .collect::<Result<Vec<_>, Error>>()?,
                    _ => vec![],
                };
                vm.new_array(element, items)
            } else if let Some(type_name) = text("new") {
                let ty = resolve_type(vm, type_name)?;
                let mut object = vm.new_object(ty);
                if let Some(toml::Value::Table(fields)) = table.get("fields") {
                    for (name, value) in fields {
                        let value = convert_value(vm, value, frame)?;
                        object = set_instance_field(vm, object, ty, name, value)?;
                    }
                }
                object
            } else {
                return Err(Error::InvalidScript(format!("unrecognized value `{value}`")));
            }
        }
    };
    Ok(converted)
}

fn set_instance_field(
    vm: &VirtualMachine,
    object: Value,
    ty: TypeId,
    name: &str,
    value: Value,
) -> Result<Value, Error> {
    match object {
        Value::Struct(mut s) => {
            let slot = s.fields.get_mut(name).ok_or_else(|| Error::MemberNotFound {
                type_name: vm.type_name(ty),
                member: name.to_string(),
            })?;
            *slot = value;
            Ok(Value::Struct(s))
        }
        object => {
            let field = vm
                .base_chain(ty)
                .iter()
                .find_map(|t| t.field(name).filter(|f| !f.is_static).cloned())
                .ok_or_else(|| Error::MemberNotFound {
                    type_name: vm.type_name(ty),
                    member: name.to_string(),
                })?;
            vm.set_field(Some(&object), &field, value)?;
            Ok(object)
        }
    }
}

#[derive(Debug)]
struct FrameState {
    method: String,
    declaring_type: TypeId,
    locals: Vec<Arc<VariableSlot>>,
    params: Vec<Arc<VariableSlot>>,
    this: Option<Value>,
    line: u32,
    pc: usize,
}

impl FrameState {
    fn find(&self, name: &str) -> Option<&Arc<VariableSlot>> {
        self.locals
            .iter()
            .chain(self.params.iter())
            .find(|slot| slot.name == name)
    }

    fn snapshot(&self, file: &str) -> StackFrame {
        StackFrame {
            address: CODE_BASE + self.pc as u64 * INSTRUCTION_SIZE,
            method: self.method.clone(),
            declaring_type: Some(self.declaring_type),
            file: Some(file.to_string()),
            line: Some(self.line),
            locals: self.locals.clone(),
            params: self.params.clone(),
            this: self.this.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
enum Phase {
    NotStarted,
    Running,
    Stopped,
    Exited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepMode {
    /// Stop at the very next statement.
    Into,
    /// Stop at the next statement of the same or an outer method.
    Over,
    /// Stop at the next statement of an outer method.
    Out,
}

#[derive(Debug, Clone, Copy)]
struct StepRequest {
    mode: StepMode,
    depth: usize,
}

impl StepRequest {
    fn is_complete(&self, depth: usize) -> bool {
        match self.mode {
            StepMode::Into => true,
            StepMode::Over => depth <= self.depth,
            StepMode::Out => depth < self.depth,
        }
    }
}

struct RunState {
    phase: Phase,
    step: Option<StepRequest>,
    interrupt: bool,
    terminate: bool,
    frames: Vec<FrameState>,
}

#[derive(Debug, Clone)]
struct BreakEntry {
    event: BreakEvent,
    enabled: bool,
    hit_count: i32,
}

/// [`DebuggerServer`] running a scripted debuggee.
pub struct EmulatedRuntime {
    callbacks: Arc<dyn ControllerCallbacks>,
    program: OnceCell<Arc<Program>>,
    options: Mutex<SessionOptions>,
    state: Mutex<RunState>,
    cv: Condvar,
    break_events: Mutex<IndexMap<BreakEventHandle, BreakEntry>>,
    next_handle: AtomicU32,
    /// Bumped on every resume, backtraces taken before that become invalid.
    resumes: Arc<AtomicU64>,
    exit_reported: AtomicBool,
}

impl EmulatedRuntime {
    pub fn new(callbacks: Arc<dyn ControllerCallbacks>) -> Self {
        Self {
            callbacks,
            program: OnceCell::new(),
            options: Mutex::default(),
            state: Mutex::new(RunState {
                phase: Phase::NotStarted,
                step: None,
                interrupt: false,
                terminate: false,
                frames: vec![],
            }),
            cv: Condvar::new(),
            break_events: Mutex::default(),
            next_handle: AtomicU32::new(1),
            resumes: Arc::new(AtomicU64::new(0)),
            exit_reported: AtomicBool::new(false),
        }
    }

    fn process_id() -> i64 {
        std::process::id() as i64
    }

    fn program(&self) -> Result<&Arc<Program>, Error> {
        self.program.get().ok_or(Error::ServerNotRunning)
    }

    fn lock_state(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap()
    }

    /// Start executing a script. A debuggee that can't be started is reported
    /// as exited, so the controller side never waits for it.
    pub fn start(self: &Arc<Self>, script: Script, options: &SessionOptions) -> Result<(), Error> {
        if let Err(e) = self.try_start(script, options) {
            weak_error!(self.callbacks.on_debugger_output(true, &e.to_string()));
            let mut event = TargetEvent::exited(None);
            event.message = Some(e.to_string());
            self.report_exit(event);
            return Err(e);
        }
        Ok(())
    }

    fn try_start(self: &Arc<Self>, script: Script, options: &SessionOptions) -> Result<(), Error> {
        {
            let state = self.lock_state();
            if state.phase != Phase::NotStarted {
                return Err(Error::InvalidState {
                    op: "run",
                    state: state.phase.to_string(),
                });
            }
        }

        let program = Arc::new(Program::new(script)?);
        if self.program.set(program.clone()).is_err() {
            return Err(Error::InvalidState {
                op: "run",
                state: Phase::Running.to_string(),
            });
        }
        *self.options.lock().unwrap() = options.clone();

        {
            let mut state = self.lock_state();
            let entry = &program.entry;
            state.frames.push(FrameState {
                method: entry.label.clone(),
                declaring_type: entry.declaring,
                locals: vec![],
                params: entry
                    .params
                    .iter()
                    .map(|(name, ty)| {
                        Arc::new(VariableSlot::new(name, *ty, program.vm.default_value(*ty)))
                    })
                    .collect(),
                this: None,
                line: program.script.statements[0].line,
                pc: 0,
            });
            state.phase = Phase::Running;
        }

        rd_info!(target: "server", "run {} ({} statements)", program.script.file, program.script.statements.len());
        self.callbacks.notify_started()?;
        self.callbacks
            .notify_source_file_loaded(&[program.script.file.clone()])?;

        let runtime = self.clone();
        thread::Builder::new()
            .name("rdbg-target".to_string())
            .spawn(move || runtime.execute(program))?;
        Ok(())
    }

    fn execute(&self, program: Arc<Program>) {
        let statements = &program.script.statements;
        for (pc, stmt) in statements.iter().enumerate() {
            if let Err(e) = self.enter_statement(&program, pc) {
                weak_error!(
                    self.callbacks.on_debugger_output(true, &format!("line {}: {e}", stmt.line))
                );
            }
            if !self.pause_if_needed(&program, pc) {
                break;
            }
            if let Err(e) = self.execute_statement(&program, pc) {
                weak_error!(
                    self.callbacks.on_debugger_output(true, &format!("line {}: {e}", stmt.line))
                );
            }
            if !self.delay(program.script.delay_ms) {
                break;
            }
        }

        let terminated = self.lock_state().terminate;
        self.lock_state().phase = Phase::Exited;
        weak_error!(self
            .callbacks
            .notify_source_file_unloaded(&[program.script.file.clone()]));
        self.report_exit(TargetEvent::exited(if terminated { None } else { Some(0) }));
    }

    /// Enter a called method if the statement has one and move to the statement line.
    fn enter_statement(&self, program: &Program, pc: usize) -> Result<(), Error> {
        let stmt = &program.script.statements[pc];
        let mut state = self.lock_state();

        if let (Some(call), Some(sig)) = (&stmt.call, &program.calls[pc]) {
            if let Some(caller) = state.frames.last_mut() {
                caller.line = stmt.line;
                caller.pc = pc;
            }
            let caller = state.frames.last();
            let mut params = Vec::with_capacity(sig.params.len());
            for (name, ty) in &sig.params {
                let value = match call.args.get(name) {
                    Some(value) => convert_value(&program.vm, value, caller)?,
                    None => program.vm.default_value(*ty),
                };
                params.push(Arc::new(VariableSlot::new(name, *ty, value)));
            }
            let this = call
                .this
                .as_ref()
                .map(|this| convert_value(&program.vm, this, caller))
                .transpose()?;
            state.frames.push(FrameState {
                method: sig.label.clone(),
                declaring_type: sig.declaring,
                locals: vec![],
                params,
                this,
                line: stmt.line,
                pc,
            });
        }

        if let Some(frame) = state.frames.last_mut() {
            frame.line = stmt.line;
            frame.pc = pc;
        }
        Ok(())
    }

    fn execute_statement(&self, program: &Program, pc: usize) -> Result<(), Error> {
        let stmt = &program.script.statements[pc];
        if let Some(line) = &stmt.output {
            self.callbacks.on_target_output(false, line)?;
        }
        if let Some(line) = &stmt.stderr {
            self.callbacks.on_target_output(true, line)?;
        }

        let mut state = self.lock_state();
        for (name, value) in &stmt.set {
            let frame = state
                .frames
                .last_mut()
                .ok_or(Error::ServerNotRunning)?;
            let value = convert_value(&program.vm, value, Some(&*frame))?;
            match frame.find(name) {
                Some(slot) => slot.set(value),
                None => {
                    let ty = program.vm.type_of(&value);
                    frame
                        .locals
                        .push(Arc::new(VariableSlot::new(name, ty, value)));
                }
            }
        }
        if stmt.ret && state.frames.len() > 1 {
            state.frames.pop();
        }
        Ok(())
    }

    /// Sleep between statements. Return `false` if the target is terminated meanwhile.
    fn delay(&self, delay_ms: u64) -> bool {
        let state = self.lock_state();
        if delay_ms == 0 {
            return !state.terminate;
        }
        let (state, _) = self
            .cv
            .wait_timeout_while(state, Duration::from_millis(delay_ms), |s| !s.terminate)
            .unwrap();
        !state.terminate
    }

    /// Stop before the statement at `pc` if something asks for it and wait until resumed.
    /// Return `false` if the target is terminated.
    fn pause_if_needed(&self, program: &Program, pc: usize) -> bool {
        let (interrupt, step_complete) = {
            let mut state = self.lock_state();
            if state.terminate {
                return false;
            }
            let depth = state.frames.len();
            let step_complete = state.step.map(|s| s.is_complete(depth)).unwrap_or(false);
            (std::mem::take(&mut state.interrupt), step_complete)
        };

        let stop = if interrupt {
            Some((TargetEventKind::TargetInterrupted, None))
        } else if let Some(handle) = self.check_break_events(program, pc) {
            Some((TargetEventKind::TargetHitBreakpoint, Some(handle)))
        } else if step_complete {
            Some((TargetEventKind::TargetStopped, None))
        } else {
            None
        };

        match stop {
            Some((kind, handle)) => self.stop_and_wait(kind, handle),
            None => true,
        }
    }

    fn stop_and_wait(&self, kind: TargetEventKind, handle: Option<BreakEventHandle>) -> bool {
        {
            let mut state = self.lock_state();
            if state.terminate {
                return false;
            }
            state.phase = Phase::Stopped;
            state.step = None;
        }

        let mut event = TargetEvent::new(kind);
        event.process_id = Some(Self::process_id());
        event.thread_id = Some(MAIN_THREAD);
        event.break_event = handle;
        rd_debug!(target: "server", "target stopped: {kind}");
        weak_error!(self.callbacks.on_target_event(&event), "report stop:");

        let state = self.lock_state();
        let state = self
            .cv
            .wait_while(state, |s| s.phase == Phase::Stopped && !s.terminate)
            .unwrap();
        !state.terminate
    }

    /// Handle of the first break event that stops the target at `pc`.
    fn check_break_events(&self, program: &Program, pc: usize) -> Option<BreakEventHandle> {
        let stmt = &program.script.statements[pc];
        let entered = program.calls[pc].as_ref();
        let candidates: Vec<_> = self
            .break_events
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, entry)| entry.enabled)
            .filter(|(_, entry)| match &entry.event.kind {
                BreakEventKind::Breakpoint { file, line } => {
                    *line == stmt.line && program.is_same_file(file)
                }
                BreakEventKind::FunctionBreakpoint { function } => entered
                    .map(|sig| {
                        sig.name == *function || sig.name.ends_with(&format!(".{function}"))
                    })
                    .unwrap_or(false),
            })
            .map(|(handle, entry)| (*handle, entry.event.clone()))
            .collect();

        for (handle, event) in candidates {
            if let Some(condition) = &event.condition {
                match self.evaluate_condition(program, condition) {
                    Ok(false) => continue,
                    Ok(true) => {}
                    Err(e) => {
                        weak_error!(self.callbacks.on_debugger_output(
                            true,
                            &format!("breakpoint {event} condition `{condition}`: {e}")
                        ));
                    }
                }
            }

            let hit_count = {
                let mut events = self.break_events.lock().unwrap();
                let Some(entry) = events.get_mut(&handle) else {
                    continue;
                };
                entry.hit_count += 1;
                entry.hit_count
            };

            if let Some(template) = &event.trace_expression {
                let trace = self.render_trace(program, template);
                weak_error!(self
                    .callbacks
                    .update_breakpoint(handle, hit_count, Some(&trace)));
                weak_error!(self.callbacks.on_debugger_output(false, &trace));
                continue;
            }

            weak_error!(self.callbacks.update_breakpoint(handle, hit_count, None));
            if let Some(action) = &event.custom_action_id {
                let stop = weak_error!(
                    self.callbacks.on_custom_breakpoint_action(action, handle),
                    "custom breakpoint action:"
                )
                .unwrap_or(false);
                if !stop {
                    continue;
                }
            }
            return Some(handle);
        }
        None
    }

    /// Evaluation context of the innermost frame.
    fn top_context(&self, program: &Program) -> Result<EvaluationContext, Error> {
        let frame = {
            let state = self.lock_state();
            let frame = state.frames.last().ok_or(Error::ServerNotRunning)?;
            Arc::new(frame.snapshot(&program.script.file))
        };
        let options = self.options.lock().unwrap().evaluation_options.clone();
        Ok(EvaluationContext::new(
            program.vm.clone(),
            program.adaptor.clone(),
            MAIN_THREAD,
            frame,
            options,
        ))
    }

    fn evaluate_condition(&self, program: &Program, condition: &str) -> Result<bool, Error> {
        let ctx = self.top_context(program)?;
        let value = evaluate(&ctx, condition)?.value(&ctx)?;
        value.as_bool().ok_or_else(|| {
            Error::Evaluation(format!("condition `{condition}` is not a boolean expression"))
        })
    }

    fn render_trace(&self, program: &Program, template: &str) -> String {
        match self.top_context(program) {
            Ok(ctx) => {
                let instance = ctx.frame.this.clone().unwrap_or(Value::Null);
                program
                    .adaptor
                    .evaluate_display_string(&ctx, &instance, template)
            }
            Err(e) => format!("{{error: {e}}}"),
        }
    }

    fn report_exit(&self, event: TargetEvent) {
        if self.exit_reported.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut event = event;
        event.process_id = Some(Self::process_id());
        rd_info!(target: "server", "target exited, code {:?}", event.exit_code);
        weak_error!(self.callbacks.on_target_event(&event), "report exit:");
    }

    fn resume(&self, op: &'static str, mode: Option<StepMode>) -> Result<(), Error> {
        let mut state = self.lock_state();
        if state.phase != Phase::Stopped {
            return Err(Error::InvalidState {
                op,
                state: state.phase.to_string(),
            });
        }
        let depth = state.frames.len();
        state.step = mode.map(|mode| StepRequest { mode, depth });
        state.phase = Phase::Running;
        self.resumes.fetch_add(1, Ordering::SeqCst);
        self.cv.notify_all();
        Ok(())
    }

    /// Terminate the target, the exit is reported once.
    pub fn shutdown(&self) {
        let not_started = {
            let mut state = self.lock_state();
            state.terminate = true;
            self.resumes.fetch_add(1, Ordering::SeqCst);
            self.cv.notify_all();
            state.phase == Phase::NotStarted
        };
        if not_started {
            self.lock_state().phase = Phase::Exited;
            self.report_exit(TargetEvent::exited(None));
        }
    }

    fn changes_allowed(&self) -> bool {
        self.lock_state().phase != Phase::Running
    }

    fn ensure_changes_allowed(&self) -> Result<(), Error> {
        if !self.changes_allowed() {
            return Err(Error::ChangeNotAllowed);
        }
        Ok(())
    }

    fn ensure_thread(&self, pid: i64, tid: i64) -> Result<(), Error> {
        if pid != Self::process_id() || tid != MAIN_THREAD {
            return Err(Error::ThreadNotFound(tid));
        }
        Ok(())
    }
}

/// [`EmulatedRuntime`] shared with its runner thread.
pub struct EmulatedServer(Arc<EmulatedRuntime>);

impl EmulatedServer {
    pub fn new(callbacks: Arc<dyn ControllerCallbacks>) -> Self {
        Self(Arc::new(EmulatedRuntime::new(callbacks)))
    }

    pub fn runtime(&self) -> &Arc<EmulatedRuntime> {
        &self.0
    }

    pub fn shutdown(&self) {
        self.0.shutdown()
    }
}

impl DebuggerServer for EmulatedServer {
    /// One way, a program that fails to load or start is reported as `TargetExited`.
    fn run(&self, start_info: &StartInfo, options: &SessionOptions) -> Result<(), Error> {
        let dir = start_info.working_dir.as_deref().unwrap_or(".");
        let path = Path::new(dir).join(&start_info.executable);
        rd_debug!(target: "server", "load program script {path:?}");
        let script = match Script::load(&path) {
            Ok(script) => script,
            Err(e) => {
                let e = Error::InvalidScript(format!("{}: {e}", path.display()));
                rd_warn!(target: "server", "run: {e}");
                weak_error!(self.0.callbacks.on_debugger_output(true, &e.to_string()));
                let mut event = TargetEvent::exited(None);
                event.message = Some(e.to_string());
                self.0.report_exit(event);
                return Ok(());
            }
        };
        // start reports its own failures as an exit
        muted_error!(self.0.start(script, options));
        Ok(())
    }

    fn attach_to_process(&self, _: i64, _: &SessionOptions) -> Result<(), Error> {
        Err(Error::NotSupported("attach to a foreign process"))
    }

    fn detach(&self) -> Result<(), Error> {
        self.0.shutdown();
        Ok(())
    }

    fn stop(&self) -> Result<(), Error> {
        let mut state = self.0.lock_state();
        if state.phase == Phase::Running {
            state.interrupt = true;
        }
        Ok(())
    }

    fn exit(&self) -> Result<(), Error> {
        self.0.shutdown();
        Ok(())
    }

    fn r#continue(&self) -> Result<(), Error> {
        self.0.resume("continue", None)
    }

    fn step_line(&self) -> Result<(), Error> {
        self.0.resume("step_line", Some(StepMode::Into))
    }

    fn next_line(&self) -> Result<(), Error> {
        self.0.resume("next_line", Some(StepMode::Over))
    }

    fn step_instruction(&self) -> Result<(), Error> {
        self.0.resume("step_instruction", Some(StepMode::Into))
    }

    fn next_instruction(&self) -> Result<(), Error> {
        self.0.resume("next_instruction", Some(StepMode::Over))
    }

    fn finish(&self) -> Result<(), Error> {
        self.0.resume("finish", Some(StepMode::Out))
    }

    fn insert_break_event(
        &self,
        event: &BreakEvent,
        activate: bool,
    ) -> Result<BreakEventHandle, Error> {
        self.0.ensure_changes_allowed()?;
        let handle = BreakEventHandle(self.0.next_handle.fetch_add(1, Ordering::Relaxed));
        self.0.break_events.lock().unwrap().insert(
            handle,
            BreakEntry {
                event: event.clone(),
                enabled: activate,
                hit_count: 0,
            },
        );
        rd_debug!(target: "server", "break event {event} inserted as {handle}");
        Ok(handle)
    }

    fn remove_break_event(&self, handle: BreakEventHandle) -> Result<(), Error> {
        self.0.ensure_changes_allowed()?;
        self.0
            .break_events
            .lock()
            .unwrap()
            .shift_remove(&handle)
            .map(|_| ())
            .ok_or(Error::BreakEventNotFound(handle.0))
    }

    fn enable_break_event(&self, handle: BreakEventHandle, enable: bool) -> Result<(), Error> {
        self.0.ensure_changes_allowed()?;
        let mut events = self.0.break_events.lock().unwrap();
        let entry = events
            .get_mut(&handle)
            .ok_or(Error::BreakEventNotFound(handle.0))?;
        entry.enabled = enable;
        Ok(())
    }

    fn update_break_event(
        &self,
        handle: BreakEventHandle,
        event: &BreakEvent,
    ) -> Result<(), Error> {
        self.0.ensure_changes_allowed()?;
        let mut events = self.0.break_events.lock().unwrap();
        let entry = events
            .get_mut(&handle)
            .ok_or(Error::BreakEventNotFound(handle.0))?;
        entry.event = event.clone();
        Ok(())
    }

    fn get_threads(&self, pid: i64) -> Result<Vec<ThreadInfo>, Error> {
        if pid != EmulatedRuntime::process_id() {
            return Ok(vec![]);
        }
        let state = self.0.lock_state();
        if matches!(state.phase, Phase::NotStarted | Phase::Exited) {
            return Ok(vec![]);
        }
        Ok(vec![ThreadInfo {
            process_id: pid,
            id: MAIN_THREAD,
            name: "Main Thread".to_string(),
            location: state.frames.last().map(|f| f.method.clone()),
        }])
    }

    fn get_processes(&self) -> Result<Vec<ProcessInfo>, Error> {
        let program = self.0.program()?;
        Ok(vec![ProcessInfo {
            id: EmulatedRuntime::process_id(),
            name: program.script.file.clone(),
        }])
    }

    fn get_thread_backtrace(&self, pid: i64, tid: i64) -> Result<Arc<dyn Backtrace>, Error> {
        self.0.ensure_thread(pid, tid)?;
        let program = self.0.program()?;
        let state = self.0.lock_state();
        if state.phase != Phase::Stopped {
            return Err(Error::InvalidState {
                op: "get_thread_backtrace",
                state: state.phase.to_string(),
            });
        }
        let frames = state
            .frames
            .iter()
            .rev()
            .map(|f| Arc::new(f.snapshot(&program.script.file)))
            .collect();
        Ok(Arc::new(BacktraceWrapper::new(
            program.vm.clone(),
            program.adaptor.clone(),
            tid,
            frames,
            self.0.resumes.clone(),
        )))
    }

    fn set_active_thread(&self, pid: i64, tid: i64) -> Result<(), Error> {
        self.0.ensure_thread(pid, tid)
    }

    fn disassemble_file(&self, file: &str) -> Result<Vec<AssemblyLine>, Error> {
        let program = self.0.program()?;
        if !program.is_same_file(file) {
            return Ok(vec![]);
        }
        Ok(program
            .script
            .statements
            .iter()
            .enumerate()
            .map(|(pc, stmt)| {
                let code = if let Some(call) = &stmt.call {
                    format!("call {}", call.method)
                } else if stmt.ret {
                    "ret".to_string()
                } else if stmt.output.is_some() || stmt.stderr.is_some() {
                    "out".to_string()
                } else if !stmt.set.is_empty() {
                    format!("store {}", stmt.set.keys().join(", "))
                } else {
                    "nop".to_string()
                };
                AssemblyLine {
                    address: CODE_BASE + pc as u64 * INSTRUCTION_SIZE,
                    code,
                    source_line: stmt.line,
                }
            })
            .collect())
    }

    fn initialize_mdb(
        &self,
        cached_version: Option<&str>,
        controller_pid: u32,
    ) -> Result<String, Error> {
        if let Some(version) = cached_version {
            rd_debug!(target: "server", "runtime version {version} is known by controller {controller_pid}");
            return Ok(version.to_string());
        }
        let version = format!("emulator-{}", env!("CARGO_PKG_VERSION"));
        rd_info!(target: "server", "detected runtime version {version}");
        Ok(version)
    }

    fn allow_breakpoint_changes(&self) -> Result<bool, Error> {
        Ok(self.0.changes_allowed())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::eval::EvaluationOptions;
    use std::sync::mpsc::{channel, Receiver, Sender};

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[derive(Debug, Clone, PartialEq)]
    enum Callback {
        Started,
        Event(TargetEventKind, Option<BreakEventHandle>),
        Output(bool, String),
        DebuggerOutput(String),
        Breakpoint(BreakEventHandle, i32, Option<String>),
        Loaded(Vec<String>),
        Unloaded(Vec<String>),
    }

    struct Recorder {
        tx: Mutex<Sender<Callback>>,
        stop_on_action: bool,
    }

    impl ControllerCallbacks for Recorder {
        fn wait_for_exit(&self) -> Result<(), Error> {
            Ok(())
        }

        fn notify_started(&self) -> Result<(), Error> {
            self.send(Callback::Started)
        }

        fn on_target_event(&self, event: &TargetEvent) -> Result<(), Error> {
            self.send(Callback::Event(event.kind, event.break_event))
        }

        fn on_target_output(&self, is_stderr: bool, line: &str) -> Result<(), Error> {
            self.send(Callback::Output(is_stderr, line.to_string()))
        }

        fn on_debugger_output(&self, _: bool, line: &str) -> Result<(), Error> {
            self.send(Callback::DebuggerOutput(line.to_string()))
        }

        fn on_custom_breakpoint_action(&self, _: &str, _: BreakEventHandle) -> Result<bool, Error> {
            Ok(self.stop_on_action)
        }

        fn update_breakpoint(
            &self,
            handle: BreakEventHandle,
            hit_count: i32,
            last_trace: Option<&str>,
        ) -> Result<(), Error> {
            self.send(Callback::Breakpoint(
                handle,
                hit_count,
                last_trace.map(ToString::to_string),
            ))
        }

        fn notify_source_file_loaded(&self, files: &[String]) -> Result<(), Error> {
            self.send(Callback::Loaded(files.to_vec()))
        }

        fn notify_source_file_unloaded(&self, files: &[String]) -> Result<(), Error> {
            self.send(Callback::Unloaded(files.to_vec()))
        }
    }

    impl Recorder {
        fn send(&self, cb: Callback) -> Result<(), Error> {
            _ = self.tx.lock().unwrap().send(cb);
            Ok(())
        }
    }

    const PROGRAM: &str = r#"
file = "main.cs"

[[types]]
name = "Point"
fields = [{ name = "X", type = "int" }, { name = "Y", type = "int" }]
to_string = "({X}, {Y})"

[[statements]]
line = 3
set = { count = 3, p = { new = "Point", fields = { X = 1, Y = 2 } } }

[[statements]]
line = 4
output = "hello"

[[statements]]
line = 10
call = { method = "Program.Draw(Point p, int times)", args = { p = { ref = "p" }, times = 2 } }

[[statements]]
line = 11
output = "drawing"
ret = true

[[statements]]
line = 5
stderr = "done"
"#;

    fn server(stop_on_action: bool) -> (EmulatedServer, Receiver<Callback>) {
        let (tx, rx) = channel();
        let recorder = Arc::new(Recorder {
            tx: Mutex::new(tx),
            stop_on_action,
        });
        (EmulatedServer::new(recorder), rx)
    }

    fn start(server: &EmulatedServer) {
        let script = Script::parse(PROGRAM).unwrap();
        server
            .runtime()
            .start(script, &SessionOptions::default())
            .unwrap();
    }

    /// Receive callbacks until a target event arrives.
    fn next_event(rx: &Receiver<Callback>) -> (Vec<Callback>, Callback) {
        let mut skipped = vec![];
        loop {
            let cb = rx.recv_timeout(TIMEOUT).unwrap();
            if matches!(cb, Callback::Event(..)) {
                return (skipped, cb);
            }
            skipped.push(cb);
        }
    }

    fn current_line(server: &EmulatedServer) -> u32 {
        let pid = EmulatedRuntime::process_id();
        let bt = server.get_thread_backtrace(pid, MAIN_THREAD).unwrap();
        bt.get_stack_frames(0, 1).unwrap()[0].line.unwrap()
    }

    #[test]
    fn test_run_to_exit() {
        let (server, rx) = server(false);
        start(&server);

        let (callbacks, event) = next_event(&rx);
        assert_eq!(event, Callback::Event(TargetEventKind::TargetExited, None));
        assert_eq!(
            callbacks,
            vec![
                Callback::Started,
                Callback::Loaded(vec!["main.cs".to_string()]),
                Callback::Output(false, "hello".to_string()),
                Callback::Output(false, "drawing".to_string()),
                Callback::Output(true, "done".to_string()),
                Callback::Unloaded(vec!["main.cs".to_string()]),
            ]
        );

        // exit is reported once
        server.exit().unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_breakpoint_and_backtrace() {
        let (server, rx) = server(false);
        let handle = server
            .insert_break_event(&BreakEvent::breakpoint("/src/main.cs", 11), true)
            .unwrap();
        start(&server);

        let (callbacks, event) = next_event(&rx);
        assert_eq!(
            event,
            Callback::Event(TargetEventKind::TargetHitBreakpoint, Some(handle))
        );
        assert!(callbacks.contains(&Callback::Breakpoint(handle, 1, None)));
        assert!(server.allow_breakpoint_changes().unwrap());

        let pid = EmulatedRuntime::process_id();
        let bt = server.get_thread_backtrace(pid, MAIN_THREAD).unwrap();
        assert_eq!(bt.frame_count().unwrap(), 2);
        let frames = bt.get_stack_frames(0, 2).unwrap();
        assert_eq!(frames[0].line, Some(11));
        assert!(frames[0].label.starts_with("Program.Draw"));
        assert_eq!(frames[1].line, Some(10));

        let params = bt
            .get_parameters(0, &EvaluationOptions::default())
            .unwrap();
        assert_eq!(params.len(), 2);
        assert_eq!(params[0].name, "p");
        assert_eq!(params[0].value, "(1, 2)");
        assert_eq!(params[1].value, "2");

        let locals = bt
            .get_local_variables(1, &EvaluationOptions::default())
            .unwrap();
        let names: Vec<_> = locals.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["count", "p"]);

        server.r#continue().unwrap();
        assert!(matches!(
            bt.frame_count(),
            Err(Error::BacktraceInvalidated)
        ));
        let (_, event) = next_event(&rx);
        assert_eq!(event, Callback::Event(TargetEventKind::TargetExited, None));
    }

    #[test]
    fn test_stepping() {
        let (server, rx) = server(false);
        server
            .insert_break_event(&BreakEvent::breakpoint("main.cs", 4), true)
            .unwrap();
        start(&server);
        next_event(&rx);
        assert_eq!(current_line(&server), 4);

        // step into the call
        server.step_line().unwrap();
        let (_, event) = next_event(&rx);
        assert_eq!(event, Callback::Event(TargetEventKind::TargetStopped, None));
        assert_eq!(current_line(&server), 10);

        // step out of it
        server.finish().unwrap();
        next_event(&rx);
        assert_eq!(current_line(&server), 5);

        assert!(matches!(server.stop(), Ok(())));
        server.next_line().unwrap();
        let (_, event) = next_event(&rx);
        assert_eq!(event, Callback::Event(TargetEventKind::TargetExited, None));
    }

    #[test]
    fn test_next_line_steps_over_call() {
        let (server, rx) = server(false);
        server
            .insert_break_event(&BreakEvent::breakpoint("main.cs", 4), true)
            .unwrap();
        start(&server);
        next_event(&rx);

        server.next_line().unwrap();
        next_event(&rx);
        // the call line belongs to the callee, it is deeper
        assert_eq!(current_line(&server), 5);
        server.exit().unwrap();
    }

    #[test]
    fn test_resume_requires_stopped_target() {
        let (server, _rx) = server(false);
        assert!(matches!(
            server.r#continue(),
            Err(Error::InvalidState { op: "continue", .. })
        ));
    }

    #[test]
    fn test_break_event_changes_only_while_stopped() {
        let (server, rx) = server(false);
        assert!(server.allow_breakpoint_changes().unwrap());
        let hit = server
            .insert_break_event(&BreakEvent::breakpoint("main.cs", 4), true)
            .unwrap();
        let script = Script::parse(&format!("delay_ms = 200\n{PROGRAM}")).unwrap();
        server
            .runtime()
            .start(script, &SessionOptions::default())
            .unwrap();

        assert!(!server.allow_breakpoint_changes().unwrap());
        assert!(matches!(
            server.insert_break_event(&BreakEvent::breakpoint("main.cs", 5), true),
            Err(Error::ChangeNotAllowed)
        ));
        assert!(matches!(
            server.remove_break_event(hit),
            Err(Error::ChangeNotAllowed)
        ));

        let (_, event) = next_event(&rx);
        assert_eq!(
            event,
            Callback::Event(TargetEventKind::TargetHitBreakpoint, Some(hit))
        );
        assert!(server.allow_breakpoint_changes().unwrap());
        server.remove_break_event(hit).unwrap();
        server.exit().unwrap();
    }

    #[test]
    fn test_run_reports_load_failure_as_exit() {
        let (server, rx) = server(false);
        let info = StartInfo::new("missing.toml").with_working_dir("/nonexistent");
        server.run(&info, &SessionOptions::default()).unwrap();

        let (callbacks, event) = next_event(&rx);
        assert_eq!(event, Callback::Event(TargetEventKind::TargetExited, None));
        assert!(callbacks
            .iter()
            .any(|cb| matches!(cb, Callback::DebuggerOutput(line) if line.contains("missing.toml"))));
    }

    #[test]
    fn test_conditions_traces_and_actions() {
        let (server, rx) = server(true);
        let skipped = server
            .insert_break_event(
                &BreakEvent::breakpoint("main.cs", 4).with_condition("false"),
                true,
            )
            .unwrap();
        let traced = server
            .insert_break_event(
                &BreakEvent::breakpoint("main.cs", 11).with_trace("p is {p}, times {times}"),
                true,
            )
            .unwrap();
        let action = server
            .insert_break_event(&BreakEvent::function("Draw").with_custom_action("ask"), true)
            .unwrap();
        start(&server);

        let (callbacks, event) = next_event(&rx);
        assert_eq!(
            event,
            Callback::Event(TargetEventKind::TargetHitBreakpoint, Some(action))
        );
        assert!(!callbacks
            .iter()
            .any(|cb| matches!(cb, Callback::Breakpoint(h, ..) if *h == skipped)));

        server.r#continue().unwrap();
        let (callbacks, _) = next_event(&rx);
        assert!(callbacks.contains(&Callback::Breakpoint(
            traced,
            1,
            Some("p is (1, 2), times 2".to_string())
        )));
        assert!(callbacks.contains(&Callback::DebuggerOutput("p is (1, 2), times 2".to_string())));
    }

    #[test]
    fn test_disabled_and_removed_break_events() {
        let (server, rx) = server(false);
        let first = server
            .insert_break_event(&BreakEvent::breakpoint("main.cs", 4), false)
            .unwrap();
        let second = server
            .insert_break_event(&BreakEvent::breakpoint("main.cs", 5), true)
            .unwrap();
        assert_ne!(first, second);
        server.remove_break_event(second).unwrap();
        assert!(matches!(
            server.remove_break_event(second),
            Err(Error::BreakEventNotFound(_))
        ));
        start(&server);

        let (_, event) = next_event(&rx);
        assert_eq!(event, Callback::Event(TargetEventKind::TargetExited, None));
    }

    #[test]
    fn test_invalid_script() {
        assert!(matches!(
            Script::parse("file = \"a.cs\"\nstatements = []"),
            Err(Error::InvalidScript(_))
        ));

        let script = Script::parse(
            r#"
file = "a.cs"
[[statements]]
line = 1
set = { x = { new = "Missing" } }
"#,
        )
        .unwrap();
        // unknown types fail at execution, not at load
        let (server, rx) = server(false);
        server
            .runtime()
            .start(script, &SessionOptions::default())
            .unwrap();
        let (callbacks, event) = next_event(&rx);
        assert_eq!(event, Callback::Event(TargetEventKind::TargetExited, None));
        assert!(callbacks
            .iter()
            .any(|cb| matches!(cb, Callback::DebuggerOutput(line) if line.contains("Missing"))));
    }

    #[test]
    fn test_disassemble() {
        let (server, rx) = server(false);
        server
            .insert_break_event(&BreakEvent::breakpoint("main.cs", 3), true)
            .unwrap();
        start(&server);
        next_event(&rx);

        let lines = server.disassemble_file("main.cs").unwrap();
        assert_eq!(lines.len(), 5);
        assert_eq!(lines[0].address, CODE_BASE);
        assert_eq!(lines[0].code, "store count, p");
        assert_eq!(lines[2].code, "call Program.Draw(Point p, int times)");
        assert_eq!(lines[3].source_line, 11);
        assert!(server.disassemble_file("other.cs").unwrap().is_empty());
        server.exit().unwrap();
    }
}
