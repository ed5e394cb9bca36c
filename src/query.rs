//! Boolean search expressions over contact fields.
//!
//! Expressions arrive from the address book as s-expressions, e.g.
//! `(and (contains "full_name" "smith") (exists "email"))`.

/// A search expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
	/// All sub-expressions match
	And(Vec<Query>),
	/// Any sub-expression matches
	Or(Vec<Query>),
	/// The sub-expression does not match
	Not(Box<Query>),
	/// The field contains the text
	Contains(String, String),
	/// The field equals the text
	Is(String, String),
	/// The field starts with the text
	BeginsWith(String, String),
	/// The field ends with the text
	EndsWith(String, String),
	/// The field has a value
	Exists(String),
}

/// Errors produced while parsing a query string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
	/// The input ended in the middle of an expression.
	#[error("Unexpected end of query")]
	UnexpectedEnd,
	/// A token appeared where it is not allowed.
	#[error("Unexpected {0:?} in query")]
	Unexpected(String),
	/// The operator is not known.
	#[error("Unknown operator {0:?}")]
	UnknownOperator(String),
	/// Expressions are nested deeper than [`MAX_DEPTH`].
	#[error("Query is nested too deeply")]
	TooDeep,
	/// An operator got the wrong number or kind of arguments.
	#[error("Operator {operator:?} expects {expected}")]
	Arity {
		/// The operator
		operator: String,
		/// A description of the expected arguments
		expected: &'static str,
	},
}

/// How deeply expressions may nest
pub const MAX_DEPTH: usize = 64;

/// A lexical token
#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
	/// `(`
	Open,
	/// `)`
	Close,
	/// A bare word, used for operators
	Symbol(String),
	/// A double-quoted string with escapes resolved
	Str(String),
}

/// A parsed argument to an operator
#[derive(Debug)]
enum Argument {
	/// A nested expression
	Query(Query),
	/// A string literal
	Str(String),
}

impl Query {
	/// Shorthand for [`Query::Contains`]
	pub fn contains(field: impl Into<String>, text: impl Into<String>) -> Self {
		Query::Contains(field.into(), text.into())
	}

	/// Shorthand for [`Query::Is`]
	pub fn is(field: impl Into<String>, text: impl Into<String>) -> Self {
		Query::Is(field.into(), text.into())
	}

	/// Shorthand for [`Query::BeginsWith`]
	pub fn begins_with(field: impl Into<String>, text: impl Into<String>) -> Self {
		Query::BeginsWith(field.into(), text.into())
	}

	/// Shorthand for [`Query::EndsWith`]
	pub fn ends_with(field: impl Into<String>, text: impl Into<String>) -> Self {
		Query::EndsWith(field.into(), text.into())
	}

	/// Shorthand for [`Query::Exists`]
	pub fn exists(field: impl Into<String>) -> Self {
		Query::Exists(field.into())
	}

	/// Parse an s-expression query.
	pub fn parse(input: &str) -> Result<Self, QueryError> {
		let tokens = tokenize(input)?;
		let mut position = 0;
		let query = match parse_argument(&tokens, &mut position, 0)? {
			Argument::Query(query) => query,
			Argument::Str(text) => return Err(QueryError::Unexpected(text)),
		};
		match tokens.get(position) {
			None => Ok(query),
			Some(token) => Err(QueryError::Unexpected(format!("{token:?}"))),
		}
	}
}

/// Split the input into tokens
fn tokenize(input: &str) -> Result<Vec<Token>, QueryError> {
	let mut tokens = Vec::new();
	let mut chars = input.chars().peekable();
	while let Some(ch) = chars.next() {
		match ch {
			'(' => tokens.push(Token::Open),
			')' => tokens.push(Token::Close),
			'"' => {
				let mut text = String::new();
				loop {
					match chars.next().ok_or(QueryError::UnexpectedEnd)? {
						'"' => break,
						'\\' => text.push(chars.next().ok_or(QueryError::UnexpectedEnd)?),
						other => text.push(other),
					}
				}
				tokens.push(Token::Str(text));
			}
			ch if ch.is_whitespace() => {}
			ch => {
				let mut symbol = String::from(ch);
				while let Some(&next) = chars.peek() {
					if next.is_whitespace() || matches!(next, '(' | ')' | '"') {
						break;
					}
					symbol.push(next);
					chars.next();
				}
				tokens.push(Token::Symbol(symbol));
			}
		}
	}
	Ok(tokens)
}

/// Parse one argument starting at `position`, `depth` expressions deep
fn parse_argument(
	tokens: &[Token],
	position: &mut usize,
	depth: usize,
) -> Result<Argument, QueryError> {
	let token = tokens.get(*position).ok_or(QueryError::UnexpectedEnd)?;
	*position += 1;
	match token {
		Token::Str(text) => Ok(Argument::Str(text.clone())),
		Token::Open if depth >= MAX_DEPTH => Err(QueryError::TooDeep),
		Token::Open => {
			let operator = match tokens.get(*position) {
				Some(Token::Symbol(symbol)) => symbol.clone(),
				Some(other) => return Err(QueryError::Unexpected(format!("{other:?}"))),
				None => return Err(QueryError::UnexpectedEnd),
			};
			*position += 1;
			let mut arguments = Vec::new();
			loop {
				match tokens.get(*position) {
					Some(Token::Close) => {
						*position += 1;
						break;
					}
					Some(_) => arguments.push(parse_argument(tokens, position, depth + 1)?),
					None => return Err(QueryError::UnexpectedEnd),
				}
			}
			build(operator, arguments).map(Argument::Query)
		}
		Token::Close => Err(QueryError::Unexpected(")".to_owned())),
		Token::Symbol(symbol) => Err(QueryError::Unexpected(symbol.clone())),
	}
}

/// Build an expression from an operator and its arguments
fn build(operator: String, arguments: Vec<Argument>) -> Result<Query, QueryError> {
	let arity = |expected| QueryError::Arity { operator: operator.clone(), expected };
	let strings = || {
		arguments
			.iter()
			.map(|argument| match argument {
				Argument::Str(text) => Some(text.clone()),
				Argument::Query(_) => None,
			})
			.collect::<Option<Vec<_>>>()
	};
	match operator.as_str() {
		"and" | "or" => {
			let children = arguments
				.into_iter()
				.map(|argument| match argument {
					Argument::Query(query) => Some(query),
					Argument::Str(_) => None,
				})
				.collect::<Option<Vec<_>>>()
				.ok_or_else(|| arity("sub-expressions"))?;
			Ok(if operator == "and" { Query::And(children) } else { Query::Or(children) })
		}
		"not" => match <[Argument; 1]>::try_from(arguments) {
			Ok([Argument::Query(query)]) => Ok(Query::Not(Box::new(query))),
			_ => Err(arity("one sub-expression")),
		},
		"exists" => match strings().as_deref() {
			Some([field]) => Ok(Query::Exists(field.clone())),
			_ => Err(arity("a field name")),
		},
		"contains" | "is" | "beginswith" | "endswith" => {
			let Some([field, text]) = strings().and_then(|s| <[String; 2]>::try_from(s).ok())
			else {
				return Err(arity("a field name and a string"));
			};
			Ok(match operator.as_str() {
				"contains" => Query::Contains(field, text),
				"is" => Query::Is(field, text),
				"beginswith" => Query::BeginsWith(field, text),
				_ => Query::EndsWith(field, text),
			})
		}
		_ => Err(QueryError::UnknownOperator(operator)),
	}
}
