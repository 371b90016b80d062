use crate::error::InvalidIdentifier;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A table name that is safe to splice into SQL: `[A-Za-z_][A-Za-z0-9_]*`,
/// optionally schema-qualified as `schema.table`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identifier(String);

impl Identifier {
    pub fn new(name: impl Into<String>) -> Result<Self, InvalidIdentifier> {
        let name = name.into();
        let parts: Vec<&str> = name.split('.').collect();
        let valid = parts.len() <= 2 && parts.iter().all(|part| valid_part(part));
        if valid {
            Ok(Self(name))
        } else {
            Err(InvalidIdentifier(name))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn valid_part(part: &str) -> bool {
    let mut chars = part.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}

impl FromStr for Identifier {
    type Err = InvalidIdentifier;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for Identifier {
    type Error = InvalidIdentifier;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Identifier> for String {
    fn from(value: Identifier) -> Self {
        value.0
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Statements the pipeline issues against the warehouse.
///
/// `select` and `format_spec` are trusted fragments owned by the pipeline
/// definition; every other value is either a validated [`Identifier`] or is
/// rendered as an escaped string literal.
#[derive(Clone, PartialEq, Eq)]
pub enum Statement {
    Truncate {
        table: Identifier,
    },
    InsertSelect {
        table: Identifier,
        select: String,
    },
    CountRows {
        table: Identifier,
    },
    Copy {
        table: Identifier,
        source_uri: String,
        access_key: String,
        secret_key: String,
        format_spec: String,
        region: String,
    },
}

impl Statement {
    pub fn table(&self) -> &Identifier {
        match self {
            Self::Truncate { table }
            | Self::InsertSelect { table, .. }
            | Self::CountRows { table }
            | Self::Copy { table, .. } => table,
        }
    }

    pub fn to_sql(&self) -> String {
        match self {
            Self::Truncate { table } => format!("TRUNCATE {table}"),
            Self::InsertSelect { table, select } => {
                format!("INSERT INTO {table} {}", select.trim())
            }
            Self::CountRows { table } => format!("SELECT COUNT(*) FROM {table}"),
            Self::Copy {
                table,
                source_uri,
                access_key,
                secret_key,
                format_spec,
                region,
            } => format!(
                "COPY {table} FROM {} ACCESS_KEY_ID {} SECRET_ACCESS_KEY {} {} REGION {}",
                quote_literal(source_uri),
                quote_literal(access_key),
                quote_literal(secret_key),
                format_spec.trim(),
                quote_literal(region),
            ),
        }
    }
}

/// Rendered SQL with credentials masked, safe to log.
impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Copy {
                table,
                source_uri,
                format_spec,
                region,
                ..
            } => write!(
                f,
                "COPY {table} FROM {} ACCESS_KEY_ID '***' SECRET_ACCESS_KEY '***' {} REGION {}",
                quote_literal(source_uri),
                format_spec.trim(),
                quote_literal(region),
            ),
            other => f.write_str(&other.to_sql()),
        }
    }
}

impl fmt::Debug for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Statement({self})")
    }
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
