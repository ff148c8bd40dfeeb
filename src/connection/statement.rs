use crate::core::{DbError, Result};
use crate::result::QueryResult;
use serde_json::Value;
use sqlparser::ast as sql_ast;
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

/// Statements understood by the in-memory session.
///
/// Row data goes through the typed data API; raw SQL is limited to transaction
/// control and literal probes such as `SELECT 1`.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Begin,
    Commit,
    Rollback,
    Savepoint(String),
    RollbackToSavepoint(String),
    ReleaseSavepoint(String),
    SelectLiterals(QueryResult),
}

pub fn parse_statement(sql: &str) -> Result<Statement> {
    // Bare transaction keywords are matched before the parser sees them
    let trimmed = sql.trim().trim_end_matches(';').trim().to_uppercase();
    match trimmed.as_str() {
        "BEGIN" | "BEGIN TRANSACTION" | "START TRANSACTION" => return Ok(Statement::Begin),
        "COMMIT" | "COMMIT TRANSACTION" => return Ok(Statement::Commit),
        "ROLLBACK" | "ROLLBACK TRANSACTION" => return Ok(Statement::Rollback),
        _ => {}
    }

    let mut statements = Parser::parse_sql(&PostgreSqlDialect {}, sql)
        .map_err(|e| DbError::ParseError(e.to_string()))?;

    if statements.len() != 1 {
        return Err(DbError::ParseError(format!(
            "Expected exactly one statement, found {}",
            statements.len()
        )));
    }

    match statements.remove(0) {
        sql_ast::Statement::StartTransaction { .. } => Ok(Statement::Begin),
        sql_ast::Statement::Commit { .. } => Ok(Statement::Commit),
        sql_ast::Statement::Rollback { savepoint: None, .. } => Ok(Statement::Rollback),
        sql_ast::Statement::Rollback {
            savepoint: Some(name),
            ..
        } => Ok(Statement::RollbackToSavepoint(name.value)),
        sql_ast::Statement::Savepoint { name } => Ok(Statement::Savepoint(name.value)),
        sql_ast::Statement::ReleaseSavepoint { name } => {
            Ok(Statement::ReleaseSavepoint(name.value))
        }
        sql_ast::Statement::Query(query) => convert_literal_select(&query),
        other => Err(DbError::UnsupportedOperation(format!(
            "Statement not supported by the in-memory provider: {}",
            other
        ))),
    }
}

fn convert_literal_select(query: &sql_ast::Query) -> Result<Statement> {
    let sql_ast::SetExpr::Select(select) = query.body.as_ref() else {
        return Err(DbError::UnsupportedOperation(
            "Only SELECT of literals is supported".into(),
        ));
    };

    if !select.from.is_empty() {
        return Err(DbError::UnsupportedOperation(
            "SELECT ... FROM is not supported; use the session data API".into(),
        ));
    }

    let mut columns = Vec::with_capacity(select.projection.len());
    let mut row = Vec::with_capacity(select.projection.len());

    for item in &select.projection {
        let (expr, name) = match item {
            sql_ast::SelectItem::UnnamedExpr(expr) => (expr, "?column?".to_string()),
            sql_ast::SelectItem::ExprWithAlias { expr, alias } => (expr, alias.value.clone()),
            _ => {
                return Err(DbError::UnsupportedOperation(
                    "Wildcard projection is not supported".into(),
                ));
            }
        };
        columns.push(name);
        row.push(convert_literal(expr)?);
    }

    Ok(Statement::SelectLiterals(QueryResult::new(columns, vec![row])))
}

fn convert_literal(expr: &sql_ast::Expr) -> Result<Value> {
    match expr {
        sql_ast::Expr::Value(value_with_span) => convert_value(&value_with_span.value, false),
        sql_ast::Expr::UnaryOp {
            op: sql_ast::UnaryOperator::Minus,
            expr,
        } => match expr.as_ref() {
            sql_ast::Expr::Value(value_with_span) => convert_value(&value_with_span.value, true),
            _ => Err(DbError::UnsupportedOperation("Only literals can be negated".into())),
        },
        _ => Err(DbError::UnsupportedOperation(format!(
            "Only literal projections are supported, got {}",
            expr
        ))),
    }
}

fn convert_value(value: &sql_ast::Value, negate: bool) -> Result<Value> {
    match value {
        sql_ast::Value::Number(n, _) => {
            let text = if negate { format!("-{}", n) } else { n.clone() };
            if let Ok(int) = text.parse::<i64>() {
                Ok(Value::from(int))
            } else {
                text.parse::<f64>()
                    .map(Value::from)
                    .map_err(|_| DbError::ParseError(format!("Invalid number: {}", text)))
            }
        }
        sql_ast::Value::SingleQuotedString(s) if !negate => Ok(Value::String(s.clone())),
        sql_ast::Value::Boolean(b) if !negate => Ok(Value::Bool(*b)),
        sql_ast::Value::Null if !negate => Ok(Value::Null),
        other => Err(DbError::UnsupportedOperation(format!(
            "Unsupported literal: {}",
            other
        ))),
    }
}
