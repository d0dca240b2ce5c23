//! Query builder producing a materialized result set with `WHERE`,
//! `ORDER BY`, `LIMIT`, `IN`/`NOT IN`, and a floating-point-tolerance
//! match via the `fuzzyMatch` SQL function registered at `open()` time.
//!
//! Structural composition (field list, `FROM`, `ORDER BY`, `LIMIT`) goes
//! through `sql-builder`, the same crate `ckb-rich-indexer` and
//! `ckb-indexer-r` use for their query layer; every bound value is still
//! passed as a `?N` placeholder, never interpolated into the string.

use crate::facade::StoreFacade;
use crate::value::Value;
use sql_builder::SqlBuilder;
use tracecap_error::{Error, Result};

/// Comparators for scalar `WHERE` clauses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Constraint {
    Equal = 0,
    NotEqual = 1,
    Less = 2,
    LessEqual = 3,
    Greater = 4,
    GreaterEqual = 5,
}

impl Constraint {
    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            0 => Constraint::Equal,
            1 => Constraint::NotEqual,
            2 => Constraint::Less,
            3 => Constraint::LessEqual,
            4 => Constraint::Greater,
            5 => Constraint::GreaterEqual,
            _ => return None,
        })
    }

    pub fn code(self) -> i32 {
        self as i32
    }

    fn sql_op(self) -> &'static str {
        match self {
            Constraint::Equal => "=",
            Constraint::NotEqual => "!=",
            Constraint::Less => "<",
            Constraint::LessEqual => "<=",
            Constraint::Greater => ">",
            Constraint::GreaterEqual => ">=",
        }
    }
}

/// How multiple `filter*` clauses combine. Defaults to `And`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOperator {
    And,
    Or,
}

pub struct Query<'f> {
    facade: &'f StoreFacade,
    table: String,
    columns: Vec<String>,
    clauses: Vec<String>,
    operator: QueryOperator,
    order_by: Option<(String, bool)>,
    limit: Option<i64>,
    params: Vec<Value>,
}

pub struct QueryResults {
    rows: std::vec::IntoIter<Vec<Value>>,
}

impl Iterator for QueryResults {
    type Item = Vec<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        self.rows.next()
    }
}

impl<'f> Query<'f> {
    pub(crate) fn new(facade: &'f StoreFacade, table: &str) -> Self {
        Self {
            facade,
            table: table.to_string(),
            columns: vec!["*".to_string()],
            clauses: Vec::new(),
            operator: QueryOperator::And,
            order_by: None,
            limit: None,
            params: Vec::new(),
        }
    }

    pub fn select(mut self, cols: &[&str]) -> Self {
        self.columns = cols.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn operator(mut self, operator: QueryOperator) -> Self {
        self.operator = operator;
        self
    }

    /// `WHERE col <constraint> value`.
    pub fn filter(mut self, col: &str, constraint: Constraint, value: Value) -> Self {
        self.params.push(value);
        let idx = self.params.len();
        self.clauses
            .push(format!("{col} {} ?{idx}", constraint.sql_op()));
        self
    }

    /// `WHERE fuzzyMatch(col, target, code) = 1`, an epsilon-tolerant
    /// comparison of a real-valued column against `target`.
    pub fn filter_fuzzy(mut self, col: &str, target: f64, constraint: Constraint) -> Self {
        self.params.push(Value::F64(target));
        let target_idx = self.params.len();
        self.params.push(Value::I32(constraint.code()));
        let code_idx = self.params.len();
        self.clauses.push(format!(
            "fuzzyMatch({col}, ?{target_idx}, ?{code_idx}) = 1"
        ));
        self
    }

    /// `WHERE col IN (...)` (or `NOT IN` when `negate` is set).
    pub fn filter_in(mut self, col: &str, values: &[Value], negate: bool) -> Self {
        let placeholders: Vec<String> = values
            .iter()
            .map(|v| {
                self.params.push(v.clone());
                format!("?{}", self.params.len())
            })
            .collect();
        let op = if negate { "NOT IN" } else { "IN" };
        self.clauses
            .push(format!("{col} {op} ({})", placeholders.join(", ")));
        self
    }

    pub fn order_by(mut self, col: &str, desc: bool) -> Self {
        self.order_by = Some((col.to_string(), desc));
        self
    }

    pub fn limit(mut self, n: i64) -> Self {
        self.limit = Some(n);
        self
    }

    pub fn run(self) -> Result<QueryResults> {
        let mut builder = SqlBuilder::select_from(self.table.as_str());
        let col_refs: Vec<&str> = self.columns.iter().map(String::as_str).collect();
        builder.fields(&col_refs);

        if !self.clauses.is_empty() {
            let joiner = match self.operator {
                QueryOperator::And => " AND ",
                QueryOperator::Or => " OR ",
            };
            builder.and_where(self.clauses.join(joiner));
        }
        if let Some((col, desc)) = &self.order_by {
            if *desc {
                builder.order_desc(col);
            } else {
                builder.order_asc(col);
            }
        }
        if let Some(limit) = self.limit {
            builder.limit(limit);
        }

        let sql = builder
            .sql()
            .map_err(|e| Error::engine("query builder", e.to_string()))?;
        let n_cols = self.columns.len();
        let params = self.params;
        let table = self.table.clone();

        self.facade.safe_transaction(move |tx| {
            let mut stmt = tx
                .conn()
                .prepare_cached(&sql)
                .map_err(|e| Error::engine(sql.clone(), e.to_string()))?;
            let param_refs: Vec<&dyn rusqlite::ToSql> =
                params.iter().map(|v| v as &dyn rusqlite::ToSql).collect();
            let rows = stmt
                .query_map(param_refs.as_slice(), |row| {
                    (0..n_cols).map(|i| row.get(i)).collect::<rusqlite::Result<Vec<Value>>>()
                })
                .map_err(|e| Error::engine(sql.clone(), e.to_string()))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row.map_err(|e| Error::engine(format!("query {table}"), e.to_string()))?);
            }
            Ok(QueryResults {
                rows: out.into_iter(),
            })
        })
    }
}
