//! SQL templates and the engine that re-targets them onto other tables.
//!
//! A template is a SQUALL-style token list (`["Column", "c3", []]`, ...)
//! written against one source table. [`TemplateEngine::instantiate`] rebinds
//! its columns and literals onto a target table, runs the result through a
//! [`QueryExecutor`] and keeps it only when the answer is usable.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::Path;

use rand::prelude::*;
use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;
use tracing::{debug, info};

use crate::common::{Cell, ColumnKind, ColumnRef, TABLE_ALIAS, TableModel, column_name};
use crate::executor::{QueryExecutor, SqlValue};

/// Upper bound for the random integer that replaces an unmatched number literal.
const RANDOM_NUMBER_MAX: i64 = 2020;

/// Column qualifiers the relational store cannot resolve; they are collapsed
/// back to the bare column in the executable query.
const COLLAPSED_QUALIFIERS: [&str; 2] = ["list", "address"];

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("failed to read template file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse template file: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum InstantiationError {
    #[error("no usable instantiation after {attempts} attempts")]
    NoViableInstantiation { attempts: usize },

    #[error("source column {column} ({kind:?}) has no counterpart in the target table")]
    SchemaMismatch { column: String, kind: ColumnKind },

    #[error("template references {column} but the source table has {num_columns} columns")]
    UnknownColumn { column: String, num_columns: usize },
}

// ============================================================================
// Template Tokens
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenKind {
    Keyword,
    Column,
    NumberLiteral,
    StringLiteral,
    /// Any tag we do not recognise. Such tokens are carried through untouched.
    Other(String),
}

impl TokenKind {
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "Keyword" => TokenKind::Keyword,
            "Column" => TokenKind::Column,
            "Literal.Number" => TokenKind::NumberLiteral,
            "Literal.String" => TokenKind::StringLiteral,
            other => TokenKind::Other(other.to_string()),
        }
    }

    pub fn tag(&self) -> &str {
        match self {
            TokenKind::Keyword => "Keyword",
            TokenKind::Column => "Column",
            TokenKind::NumberLiteral => "Literal.Number",
            TokenKind::StringLiteral => "Literal.String",
            TokenKind::Other(tag) => tag,
        }
    }

    pub fn is_literal(&self) -> bool {
        matches!(self, TokenKind::NumberLiteral | TokenKind::StringLiteral)
    }
}

/// One template token. On disk this is a `[kind, name, extra]` triple; the
/// name may be a JSON number for numeric literals.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "Vec<serde_json::Value>")]
pub struct TemplateToken {
    pub kind: TokenKind,
    pub name: String,
}

impl TemplateToken {
    pub fn new(kind: TokenKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }

    pub fn keyword(name: impl Into<String>) -> Self {
        Self::new(TokenKind::Keyword, name)
    }

    pub fn column(name: impl Into<String>) -> Self {
        Self::new(TokenKind::Column, name)
    }

    /// The parsed column reference, for column tokens with a well-formed name.
    pub fn column_ref(&self) -> Option<ColumnRef> {
        match self.kind {
            TokenKind::Column => ColumnRef::parse(&self.name),
            _ => None,
        }
    }
}

impl TryFrom<Vec<serde_json::Value>> for TemplateToken {
    type Error = String;

    fn try_from(raw: Vec<serde_json::Value>) -> Result<Self, Self::Error> {
        let mut parts = raw.into_iter();
        let kind = match parts.next() {
            Some(serde_json::Value::String(tag)) => TokenKind::from_tag(&tag),
            other => return Err(format!("expected a token kind string, found {other:?}")),
        };
        let name = match parts.next() {
            Some(serde_json::Value::String(name)) => name,
            Some(serde_json::Value::Number(n)) => n.to_string(),
            other => return Err(format!("expected a token name, found {other:?}")),
        };
        Ok(Self { kind, name })
    }
}

impl Serialize for TemplateToken {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let extra: [u8; 0] = [];
        (self.kind.tag(), &self.name, extra).serialize(serializer)
    }
}

/// An immutable token sequence. Instantiation works on fresh copies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Template(Vec<TemplateToken>);

impl Template {
    pub fn new(tokens: Vec<TemplateToken>) -> Self {
        Self(tokens)
    }

    pub fn tokens(&self) -> &[TemplateToken] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.0.iter().map(|t| t.name.as_str()).collect();
        f.write_str(&names.join(" "))
    }
}

/// One entry of a template file: the table the template was written
/// against, the tokens, and the tokenized natural-language question.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateRecord {
    pub tbl: String,
    pub sql: Template,
    #[serde(default)]
    pub nl: Vec<String>,
}

impl TemplateRecord {
    pub fn question(&self) -> String {
        self.nl.join(" ").to_lowercase()
    }
}

pub fn load_templates(path: &Path) -> Result<Vec<TemplateRecord>, TemplateError> {
    let bytes = std::fs::read(path)?;
    let records: Vec<TemplateRecord> = serde_json::from_slice(&bytes)?;
    info!("Loaded {} templates from {}", records.len(), path.display());
    Ok(records)
}

// ============================================================================
// Configuration & Results
// ============================================================================

#[derive(Debug, Clone)]
pub struct InstantiationConfig {
    /// Attempts per (template, target table) before giving up.
    pub max_attempts: usize,
    /// Answers with more values than this are rejected.
    pub max_answer_size: usize,
    /// Probability of accepting an empty result as a placeholder answer.
    pub unexecutable_prob: f64,
}

impl Default for InstantiationConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            max_answer_size: 10,
            unexecutable_prob: 0.0,
        }
    }
}

/// The accepted answer of an instantiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Answer {
    Values(Vec<String>),
    /// The query returned nothing and was kept on purpose as an
    /// unanswerable example.
    Placeholder,
}

impl Answer {
    /// The sentinel written in place of a placeholder answer.
    pub const PLACEHOLDER_TEXT: &'static str = "empty";

    pub fn is_placeholder(&self) -> bool {
        matches!(self, Answer::Placeholder)
    }

    /// The answer as written to an output record.
    pub fn values(&self) -> Vec<String> {
        match self {
            Answer::Values(values) => values.clone(),
            Answer::Placeholder => vec![Self::PLACEHOLDER_TEXT.to_string()],
        }
    }
}

#[derive(Debug, Clone)]
pub struct Instantiation {
    /// Human-facing query: header names instead of column ids, no `from w`.
    pub encoded: String,
    /// Query as run against the target table's store.
    pub executable: String,
    pub answer: Answer,
    /// 1-based number of the attempt that was accepted.
    pub attempts: usize,
    /// Source column index to target column index.
    pub column_mapping: BTreeMap<usize, usize>,
}

// ============================================================================
// Template Engine
// ============================================================================

pub struct TemplateEngine<'e> {
    executor: &'e dyn QueryExecutor,
    config: InstantiationConfig,
}

/// Lookup tables built once per `instantiate` call.
struct Candidates<'t> {
    /// Lower-cased source cell value to the source columns holding it.
    source_values: HashMap<String, BTreeSet<usize>>,
    /// Target columns per type bucket.
    target_text: Vec<usize>,
    target_number: Vec<usize>,
    /// Every non-`none` target text cell, for unmatched string literals.
    target_pool: Vec<&'t str>,
}

impl<'t> Candidates<'t> {
    fn build(source: &TableModel, target: &'t TableModel) -> Self {
        let mut source_values: HashMap<String, BTreeSet<usize>> = HashMap::new();
        for row in source.rows() {
            for (col, cell) in row.iter().enumerate() {
                source_values.entry(cell.render()).or_default().insert(col);
            }
        }

        let target_pool = target
            .rows()
            .iter()
            .flatten()
            .filter_map(|cell| match cell {
                Cell::Text(s) if !s.eq_ignore_ascii_case("none") => Some(s.as_str()),
                _ => None,
            })
            .collect();

        Self {
            source_values,
            target_text: target.columns_of_kind(ColumnKind::Text),
            target_number: target.columns_of_kind(ColumnKind::Number),
            target_pool,
        }
    }

    fn for_kind(&self, kind: ColumnKind) -> &[usize] {
        match kind {
            ColumnKind::Text => &self.target_text,
            ColumnKind::Number => &self.target_number,
        }
    }
}

/// Substitution state of a single attempt.
#[derive(Default)]
struct Substitution {
    /// Keyed by source column base index, so `c2` and `c2_number` always
    /// land on the same target column.
    columns: BTreeMap<usize, usize>,
    literals: HashMap<String, String>,
}

impl<'e> TemplateEngine<'e> {
    pub fn new(executor: &'e dyn QueryExecutor, config: InstantiationConfig) -> Self {
        Self { executor, config }
    }

    pub fn config(&self) -> &InstantiationConfig {
        &self.config
    }

    /// Rebind `template` (written against `source`) onto `target`.
    ///
    /// `target` must already reflect any rows deleted from the store behind
    /// `target_id`. Fails fast with [`InstantiationError::SchemaMismatch`]
    /// when some referenced column has no same-typed target column.
    pub fn instantiate<R: Rng + ?Sized>(
        &self,
        template: &Template,
        source: &TableModel,
        target_id: &str,
        target: &TableModel,
        rng: &mut R,
    ) -> Result<Instantiation, InstantiationError> {
        let candidates = Candidates::build(source, target);
        self.check_columns(template, source, &candidates)?;

        for attempt in 1..=self.config.max_attempts {
            let (tokens, substitution) = substitute(template, source, target, &candidates, rng);
            let executable = render_executable(&tokens);
            let encoded = render_encoded(&tokens, target);

            let answer = match self.executor.execute(target_id, &executable) {
                Ok(values) => normalize_answer(values),
                Err(err) => {
                    debug!(target_id, %executable, "query failed: {err}");
                    Vec::new()
                }
            };

            let draw: f64 = rng.random();
            let accepted = if answer.is_empty() {
                (draw < self.config.unexecutable_prob).then_some(Answer::Placeholder)
            } else if answer.len() <= self.config.max_answer_size
                && draw >= self.config.unexecutable_prob
            {
                Some(Answer::Values(answer))
            } else {
                None
            };

            match accepted {
                Some(answer) => {
                    return Ok(Instantiation {
                        encoded,
                        executable,
                        answer,
                        attempts: attempt,
                        column_mapping: substitution.columns,
                    });
                }
                None => debug!(target_id, attempt, %executable, "attempt rejected"),
            }
        }

        Err(InstantiationError::NoViableInstantiation {
            attempts: self.config.max_attempts,
        })
    }

    fn check_columns(
        &self,
        template: &Template,
        source: &TableModel,
        candidates: &Candidates<'_>,
    ) -> Result<(), InstantiationError> {
        for column in template.tokens().iter().filter_map(TemplateToken::column_ref) {
            if column.index >= source.num_columns() {
                return Err(InstantiationError::UnknownColumn {
                    column: column.to_string(),
                    num_columns: source.num_columns(),
                });
            }
            let kind = source.column_kind(column.index);
            if candidates.for_kind(kind).is_empty() {
                return Err(InstantiationError::SchemaMismatch {
                    column: column.to_string(),
                    kind,
                });
            }
        }
        Ok(())
    }
}

/// One left-to-right pass over the template producing a substituted copy.
fn substitute<R: Rng + ?Sized>(
    template: &Template,
    source: &TableModel,
    target: &TableModel,
    candidates: &Candidates<'_>,
    rng: &mut R,
) -> (Vec<TemplateToken>, Substitution) {
    let mut sub = Substitution::default();
    let mut tokens = Vec::with_capacity(template.len());

    for token in template.tokens() {
        let replacement = match &token.kind {
            TokenKind::Column => match token.column_ref() {
                Some(column) => substitute_column(&column, source, target, candidates, &mut sub, rng),
                None => None,
            },
            kind if kind.is_literal() => match sub.literals.get(&token.name) {
                Some(existing) => Some(existing.clone()),
                None => {
                    let value = substitute_literal(token, target, candidates, &sub, rng);
                    if let Some(value) = &value {
                        sub.literals.insert(token.name.clone(), value.clone());
                    }
                    value
                }
            },
            _ => None,
        };

        tokens.push(match replacement {
            Some(name) => TemplateToken::new(token.kind.clone(), name),
            None => token.clone(),
        });
    }

    (tokens, sub)
}

fn substitute_column<R: Rng + ?Sized>(
    column: &ColumnRef,
    source: &TableModel,
    target: &TableModel,
    candidates: &Candidates<'_>,
    sub: &mut Substitution,
    rng: &mut R,
) -> Option<String> {
    let kind = source.column_kind(column.index);
    let target_col = match sub.columns.get(&column.index) {
        Some(&col) => col,
        None => {
            let col = *candidates.for_kind(kind).choose(rng)?;
            sub.columns.insert(column.index, col);
            col
        }
    };

    let Some(qualifier) = &column.qualifier else {
        return Some(column_name(target_col));
    };
    let compound = ColumnRef::new(target_col, Some(qualifier.clone())).to_string();
    if target.alias().contains(&compound) {
        Some(compound)
    } else if kind == ColumnKind::Number {
        Some(format!("{}_number", column_name(target_col)))
    } else {
        Some(column_name(target_col))
    }
}

/// Replace a literal by a value of the target table. Literals that occur in
/// the source table follow the column they came from; a literal whose source
/// columns are not yet bound in this attempt is left as is.
fn substitute_literal<R: Rng + ?Sized>(
    token: &TemplateToken,
    target: &TableModel,
    candidates: &Candidates<'_>,
    sub: &Substitution,
    rng: &mut R,
) -> Option<String> {
    let value = token.name.trim_matches('\'').to_lowercase();
    match candidates.source_values.get(&value) {
        Some(columns) => {
            let bound: Vec<usize> = columns
                .iter()
                .copied()
                .filter(|col| sub.columns.contains_key(col))
                .collect();
            let source_col = bound.choose(rng)?;
            let target_col = sub.columns[source_col];
            let row = target.rows().choose(rng)?;
            Some(literal_text(&row[target_col].to_string()))
        }
        None => match token.kind {
            TokenKind::NumberLiteral => Some(rng.random_range(0..=RANDOM_NUMBER_MAX).to_string()),
            _ => candidates.target_pool.choose(rng).map(|s| quote(s)),
        },
    }
}

/// Integers are emitted bare, everything else single-quoted.
fn literal_text(value: &str) -> String {
    match value.trim().parse::<i64>() {
        Ok(v) => v.to_string(),
        Err(_) => quote(value),
    }
}

fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

// ============================================================================
// Rendering
// ============================================================================

fn render_executable(tokens: &[TemplateToken]) -> String {
    let parts: Vec<String> = tokens
        .iter()
        .map(|token| match token.column_ref() {
            Some(column) if is_collapsed(&column) => column.base_name(),
            _ => token.name.clone(),
        })
        .collect();
    parts.join(" ")
}

fn is_collapsed(column: &ColumnRef) -> bool {
    column.qualifier.as_deref().is_some_and(|q| {
        q.split('_')
            .any(|part| COLLAPSED_QUALIFIERS.contains(&part))
    })
}

fn render_encoded(tokens: &[TemplateToken], target: &TableModel) -> String {
    let parts: Vec<&str> = tokens
        .iter()
        .filter(|token| token.name != "from" && token.name != TABLE_ALIAS)
        .map(|token| match token.column_ref() {
            Some(column) if column.index < target.num_columns() => {
                target.header()[column.index].as_str()
            }
            _ => token.name.as_str(),
        })
        .collect();
    parts.join(" ")
}

/// Stringify non-null values, flatten newlines and lower-case. A result made
/// only of `none` sentinels counts as empty.
fn normalize_answer(values: Vec<SqlValue>) -> Vec<String> {
    let answer: Vec<String> = values
        .into_iter()
        .filter(|v| !v.is_null())
        .map(|v| v.to_string().replace('\n', " ").to_lowercase())
        .collect();
    if answer.iter().all(|v| v == "none") {
        Vec::new()
    } else {
        answer
    }
}

// ============================================================================
// Tests
// ============================================================================
