///
/// # Argument Formats
///
/// A statement's argument format is one character per callback argument:
///
/// | Char        | Meaning                                              |
/// |-------------|------------------------------------------------------|
/// | `a` `A`     | array of cells, consumes one `Value::Array`          |
/// | `b c d i f` | scalar cell (any case), consumes one `Value::Cell`   |
/// | `r` `R`     | the statement's own id, consumes nothing             |
/// | `s` `S`     | string, consumes one `Value::Str`                    |
/// | `&x`        | reference cell, consumes one `Value::Cell`; the `x`  |
/// |             | that follows is part of the marker and never read    |
///
/// Parameters are positional: every character except `r` takes the next
/// parameter. An unrecognised character still occupies its parameter slot;
/// under `UnknownSpecifierPolicy::Skip` that parameter is logged and dropped,
/// under `Reject` the whole submission fails.
///

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::FormatError;
use crate::ids::Cell;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UnknownSpecifierPolicy {
    #[default]
    Skip,
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgSpec {
    Array,
    Cell,
    StatementId,
    Str,
    /// `&` followed by the swallowed tag character.
    Reference(char),
    Unknown(char),
}

impl ArgSpec {
    fn from_char(c: char) -> Self {
        match c {
            'a' | 'A' => ArgSpec::Array,
            'b' | 'B' | 'c' | 'C' | 'd' | 'D' | 'i' | 'I' | 'f' | 'F' => ArgSpec::Cell,
            'r' | 'R' => ArgSpec::StatementId,
            's' | 'S' => ArgSpec::Str,
            other => ArgSpec::Unknown(other),
        }
    }

    fn symbol(self) -> char {
        match self {
            ArgSpec::Array => 'a',
            ArgSpec::Cell => 'd',
            ArgSpec::StatementId => 'r',
            ArgSpec::Str => 's',
            ArgSpec::Reference(_) => '&',
            ArgSpec::Unknown(c) => c,
        }
    }
}

/// A bound argument, in format order.
#[derive(Debug, Clone, PartialEq)]
pub enum BoundArg {
    Array(Vec<Cell>),
    Cell(Cell),
    /// Filled in with the statement id when the callback is built.
    StatementId,
    Str(String),
    Reference(Cell),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgFormat {
    source: String,
    specs: Vec<ArgSpec>,
}

impl ArgFormat {
    pub fn parse(source: &str) -> Self {
        let mut specs = Vec::with_capacity(source.len());
        let mut chars = source.chars();
        while let Some(c) = chars.next() {
            if c == '&' {
                match chars.next() {
                    Some(tag) => specs.push(ArgSpec::Reference(tag)),
                    None => specs.push(ArgSpec::Unknown('&')),
                }
            } else {
                specs.push(ArgSpec::from_char(c));
            }
        }
        Self {
            source: source.to_string(),
            specs,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn specs(&self) -> &[ArgSpec] {
        &self.specs
    }

    /// Pairs each spec with its positional parameter.
    pub fn bind(
        &self,
        params: Vec<Value>,
        policy: UnknownSpecifierPolicy,
    ) -> Result<Vec<BoundArg>, FormatError> {
        let mut bound = Vec::with_capacity(self.specs.len());
        let mut params = params.into_iter();

        for (position, spec) in self.specs.iter().copied().enumerate() {
            if spec == ArgSpec::StatementId {
                bound.push(BoundArg::StatementId);
                continue;
            }

            let param = params.next();

            if let ArgSpec::Unknown(c) = spec {
                match policy {
                    UnknownSpecifierPolicy::Skip => {
                        warn!(spec = %c, position, format = %self.source, "format character is not recognized");
                        continue;
                    }
                    UnknownSpecifierPolicy::Reject => {
                        return Err(FormatError::UnknownSpecifier { spec: c, position });
                    }
                }
            }

            let Some(param) = param else {
                return Err(FormatError::MissingParameter {
                    spec: spec.symbol(),
                    position,
                });
            };

            let arg = match (spec, param) {
                (ArgSpec::Array, Value::Array(cells)) => BoundArg::Array(cells),
                (ArgSpec::Cell, Value::Cell(cell)) => BoundArg::Cell(cell),
                (ArgSpec::Str, Value::Str(s)) => BoundArg::Str(s),
                (ArgSpec::Reference(_), Value::Cell(cell)) => BoundArg::Reference(cell),
                (spec, found) => {
                    return Err(FormatError::TypeMismatch {
                        spec: spec.symbol(),
                        position,
                        expected: expected_kind(spec),
                        found: found.kind_name(),
                    });
                }
            };
            bound.push(arg);
        }

        let extra = params.count();
        if extra > 0 {
            warn!(extra, format = %self.source, "parameters beyond the format string are ignored");
        }

        Ok(bound)
    }
}

fn expected_kind(spec: ArgSpec) -> &'static str {
    match spec {
        ArgSpec::Array => "array",
        ArgSpec::Str => "string",
        _ => "cell",
    }
}
