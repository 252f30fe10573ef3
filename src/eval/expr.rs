//! Debugger expressions parser.
use crate::error::Error;
use chumsky::prelude::*;
use chumsky::Parser;
use itertools::Itertools;
use std::fmt::{Display, Formatter};

type Err<'a> = extra::Err<Rich<'a, char>>;

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Int(i64),
    Float(f64),
    String(String),
    Char(char),
    Bool(bool),
    Null,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Literal),
    Ident(String),
    This,
    Member(Box<Expr>, String),
    Call {
        target: Option<Box<Expr>>,
        method: String,
        args: Vec<Expr>,
    },
    Index(Box<Expr>, Vec<Expr>),
}

impl Display for Literal {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Literal::Int(v) => write!(f, "{v}"),
            Literal::Float(v) => write!(f, "{v:?}"),
            Literal::String(s) => write!(f, "{s:?}"),
            Literal::Char(c) => write!(f, "'{}'", c.escape_default()),
            Literal::Bool(b) => write!(f, "{b}"),
            Literal::Null => f.write_str("null"),
        }
    }
}

impl Display for Expr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Expr::Literal(l) => write!(f, "{l}"),
            Expr::Ident(name) => f.write_str(name),
            Expr::This => f.write_str("this"),
            Expr::Member(target, name) => write!(f, "{target}.{name}"),
            Expr::Call {
                target,
                method,
                args,
            } => {
                if let Some(target) = target {
                    write!(f, "{target}.")?;
                }
                write!(f, "{method}({})", args.iter().join(", "))
            }
            Expr::Index(target, args) => write!(f, "{target}[{}]", args.iter().join(", ")),
        }
    }
}

enum Postfix {
    Member(String),
    Call(String, Vec<Expr>),
    Index(Vec<Expr>),
}

fn keyword_or_ident(name: &str) -> Expr {
    match name {
        "true" => Expr::Literal(Literal::Bool(true)),
        "false" => Expr::Literal(Literal::Bool(false)),
        "null" => Expr::Literal(Literal::Null),
        "this" => Expr::This,
        _ => Expr::Ident(name.to_string()),
    }
}

fn escape<'a>() -> impl Parser<'a, &'a str, char, Err<'a>> + Clone {
    just('\\').ignore_then(choice((
        just('\\'),
        just('"'),
        just('\''),
        just('n').to('\n'),
        just('t').to('\t'),
        just('r').to('\r'),
        just('0').to('\0'),
    )))
}

fn literal<'a>() -> impl Parser<'a, &'a str, Literal, Err<'a>> + Clone {
    let float = just('-')
        .or_not()
        .then(text::int(10))
        .then(just('.'))
        .then(text::digits(10).at_least(1))
        .to_slice()
        .try_map(|s: &str, span| {
            s.parse::<f64>()
                .map(Literal::Float)
                .map_err(|e| Rich::custom(span, e))
        })
        .labelled("float");

    let int = just('-')
        .or_not()
        .then(text::int(10))
        .to_slice()
        .try_map(|s: &str, span| {
            s.parse::<i64>()
                .map(Literal::Int)
                .map_err(|e| Rich::custom(span, e))
        })
        .labelled("integer");

    let string = any::<_, Err>()
        .filter(|c: &char| *c != '\\' && *c != '"')
        .or(escape())
        .repeated()
        .collect::<String>()
        .delimited_by(just('"'), just('"'))
        .map(Literal::String)
        .labelled("string");

    let chr = any::<_, Err>()
        .filter(|c: &char| *c != '\\' && *c != '\'')
        .or(escape())
        .delimited_by(just('\''), just('\''))
        .map(Literal::Char)
        .labelled("char");

    choice((float, int, string, chr))
}

pub fn parser<'a>() -> impl Parser<'a, &'a str, Expr, Err<'a>> {
    let expr = recursive(|expr| {
        let op = |c| just(c).padded();

        let args = expr
            .clone()
            .separated_by(op(','))
            .collect::<Vec<_>>()
            .labelled("arguments");
        let call_args = args.clone().delimited_by(op('('), op(')'));

        let name = text::ascii::ident()
            .then(call_args.clone().or_not())
            .map(|(name, args): (&str, Option<Vec<Expr>>)| match args {
                Some(args) => Expr::Call {
                    target: None,
                    method: name.to_string(),
                    args,
                },
                None => keyword_or_ident(name),
            });

        let atom = choice((
            literal().map(Expr::Literal),
            name,
            expr.delimited_by(op('('), op(')')),
        ))
        .padded();

        let member = op('.')
            .ignore_then(
                text::ascii::ident()
                    .map(|s: &str| s.to_string())
                    .labelled("member name"),
            )
            .then(call_args.or_not())
            .map(|(name, args)| match args {
                Some(args) => Postfix::Call(name, args),
                None => Postfix::Member(name),
            });
        let index = args.delimited_by(op('['), op(']')).map(Postfix::Index);

        atom.foldl(member.or(index).repeated(), |lhs, postfix| match postfix {
            Postfix::Member(name) => Expr::Member(Box::new(lhs), name),
            Postfix::Call(method, args) => Expr::Call {
                target: Some(Box::new(lhs)),
                method,
                args,
            },
            Postfix::Index(args) => Expr::Index(Box::new(lhs), args),
        })
    });

    expr.then_ignore(end())
}

/// Parse an expression typed by a user.
pub fn parse(input: &str) -> Result<Expr, Error> {
    parser().parse(input).into_result().map_err(|errs| {
        Error::ExpressionParsing(errs.into_iter().map(|e| e.to_string()).join("; "))
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn ident(name: &str) -> Box<Expr> {
        Box::new(Expr::Ident(name.to_string()))
    }

    #[test]
    fn test_literals() {
        struct TestCase {
            string: &'static str,
            literal: Literal,
        }
        let cases = vec![
            TestCase {
                string: "42",
                literal: Literal::Int(42),
            },
            TestCase {
                string: "-7",
                literal: Literal::Int(-7),
            },
            TestCase {
                string: "1.25",
                literal: Literal::Float(1.25),
            },
            TestCase {
                string: r#""a \"quoted\" line\n""#,
                literal: Literal::String("a \"quoted\" line\n".to_string()),
            },
            TestCase {
                string: "'x'",
                literal: Literal::Char('x'),
            },
            TestCase {
                string: r"'\''",
                literal: Literal::Char('\''),
            },
            TestCase {
                string: " true ",
                literal: Literal::Bool(true),
            },
            TestCase {
                string: "null",
                literal: Literal::Null,
            },
        ];

        for tc in cases {
            assert_eq!(
                parse(tc.string).unwrap(),
                Expr::Literal(tc.literal),
                "case: {}",
                tc.string
            );
        }
    }

    #[test]
    fn test_expr_parsing() {
        struct TestCase {
            string: &'static str,
            expr: Expr,
        }
        let cases = vec![
            TestCase {
                string: "count",
                expr: Expr::Ident("count".to_string()),
            },
            TestCase {
                string: "this.name",
                expr: Expr::Member(Box::new(Expr::This), "name".to_string()),
            },
            TestCase {
                string: "p.Origin.x",
                expr: Expr::Member(
                    Box::new(Expr::Member(ident("p"), "Origin".to_string())),
                    "x".to_string(),
                ),
            },
            TestCase {
                string: "f(1, \"a\")",
                expr: Expr::Call {
                    target: None,
                    method: "f".to_string(),
                    args: vec![
                        Expr::Literal(Literal::Int(1)),
                        Expr::Literal(Literal::String("a".to_string())),
                    ],
                },
            },
            TestCase {
                string: "list.Get( i ).ToString()",
                expr: Expr::Call {
                    target: Some(Box::new(Expr::Call {
                        target: Some(ident("list")),
                        method: "Get".to_string(),
                        args: vec![Expr::Ident("i".to_string())],
                    })),
                    method: "ToString".to_string(),
                    args: vec![],
                },
            },
            TestCase {
                string: "grid[1, j][0]",
                expr: Expr::Index(
                    Box::new(Expr::Index(
                        ident("grid"),
                        vec![Expr::Literal(Literal::Int(1)), Expr::Ident("j".to_string())],
                    )),
                    vec![Expr::Literal(Literal::Int(0))],
                ),
            },
            TestCase {
                string: "(items).Length",
                expr: Expr::Member(ident("items"), "Length".to_string()),
            },
        ];

        for tc in cases {
            let expr = parse(tc.string).unwrap();
            assert_eq!(expr, tc.expr, "case: {}", tc.string);
        }
    }

    #[test]
    fn test_invalid_expressions() {
        for string in ["", "a.", "f(1,", "a[]]", "1 2", "\"unterminated"] {
            assert!(
                matches!(parse(string), Err(Error::ExpressionParsing(_))),
                "case: {string}"
            );
        }
    }

    #[test]
    fn test_display_round_trip() {
        for string in ["a.b[1].c(2, 'x', \"s\")", "this.F(null, true)", "Program.Counter"] {
            let expr = parse(string).unwrap();
            assert_eq!(parse(&expr.to_string()).unwrap(), expr);
        }
    }
}
