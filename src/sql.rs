use std::collections::BTreeMap;

use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::limits::MAX_BATCH_SIZE;
use crate::model::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Resources,
    Reservations,
    Appointments,
}

impl Table {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "resources" => Some(Table::Resources),
            "reservations" => Some(Table::Reservations),
            "appointments" => Some(Table::Appointments),
            _ => None,
        }
    }

    pub fn kind(self) -> EntityKind {
        match self {
            Table::Resources => EntityKind::Resource,
            Table::Reservations => EntityKind::Reservation,
            Table::Appointments => EntityKind::Appointment,
        }
    }
}

/// A literal from a VALUES row or a SET clause.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Null,
    Text(String),
    Int(i64),
    Bool(bool),
}

/// One row of an INSERT. `id` is allocated by the server when omitted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRow {
    pub id: Option<Ulid>,
    pub payload: Payload,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TableFilter {
    All,
    Id(Ulid),
    Reservation(Ulid),
}

/// Parsed command from SQL input.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// All rows of one INSERT commit as one transaction.
    Insert {
        table: Table,
        rows: Vec<NewRow>,
        returning: bool,
    },
    Update {
        table: Table,
        id: Ulid,
        expected: Ms,
        patch: Vec<(String, Literal)>,
        returning: bool,
    },
    Delete {
        table: Table,
        id: Ulid,
        expected: Ms,
    },
    SelectEvents {
        request: QueryRequest,
    },
    SelectTable {
        table: Table,
        filter: TableFilter,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            returning,
            ..
        } => parse_update(table, assignments, selection, returning.is_some()),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let name = insert_table_name(insert)?;
    let table = Table::from_name(&name).ok_or(SqlError::UnknownTable(name))?;
    let columns: Vec<String> = insert.columns.iter().map(|c| c.value.to_lowercase()).collect();
    if columns.is_empty() {
        return Err(SqlError::Parse("INSERT needs an explicit column list".into()));
    }

    let rows = extract_all_insert_rows(insert)?;
    if rows.len() > MAX_BATCH_SIZE {
        return Err(SqlError::Parse(format!("at most {MAX_BATCH_SIZE} rows per INSERT")));
    }

    let mut out = Vec::with_capacity(rows.len());
    for (i, row) in rows.iter().enumerate() {
        if row.len() != columns.len() {
            return Err(SqlError::WrongArity("VALUES row", columns.len(), row.len()));
        }
        let mut id = None;
        let mut payload = empty_payload(table);
        let mut seen = Vec::with_capacity(columns.len());
        for (column, expr) in columns.iter().zip(row) {
            let literal = parse_literal(expr).map_err(|e| SqlError::Parse(format!("row {i}: {e}")))?;
            if column == "id" {
                id = literal_ulid_or_null(&literal)?;
            } else {
                set_column(&mut payload, column, literal)?;
                seen.push(column.as_str());
            }
        }
        for required in required_columns(table) {
            if !seen.contains(required) {
                return Err(SqlError::MissingColumn(required));
            }
        }
        out.push(NewRow { id, payload });
    }
    Ok(Command::Insert {
        table,
        rows: out,
        returning: insert.returning.is_some(),
    })
}

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
    returning: bool,
) -> Result<Command, SqlError> {
    let name = table_factor_name(&table.relation)?;
    let table = Table::from_name(&name).ok_or(SqlError::UnknownTable(name))?;
    let (id, expected) = extract_version_filter(selection)?;

    let mut patch = Vec::with_capacity(assignments.len());
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name)
                .ok_or_else(|| SqlError::Parse("empty column name".into()))?,
            AssignmentTarget::Tuple(_) => {
                return Err(SqlError::Unsupported("tuple assignment".into()));
            }
        };
        if column == "id" || column == "last_modified" {
            return Err(SqlError::Unsupported(format!("{column} cannot be assigned")));
        }
        patch.push((column, parse_literal(&assignment.value)?));
    }
    if patch.is_empty() {
        return Err(SqlError::Parse("UPDATE without SET".into()));
    }
    // Check the columns against the table now rather than after a round trip to the store.
    apply_patch(&empty_payload(table), &patch)?;

    Ok(Command::Update { table, id, expected, patch, returning })
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let name = delete_table_name(delete)?;
    let table = Table::from_name(&name).ok_or(SqlError::UnknownTable(name))?;
    let (id, expected) = extract_version_filter(&delete.selection)?;
    Ok(Command::Delete { table, id, expected })
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let name = table_factor_name(&select.from[0].relation)?;

    let mut conditions = Vec::new();
    if let Some(selection) = &select.selection {
        conjuncts(selection, &mut conditions);
    }

    if name == "events" {
        return parse_events_filters(&conditions);
    }

    let table = Table::from_name(&name).ok_or(SqlError::UnknownTable(name))?;
    let mut filter = TableFilter::All;
    for cond in conditions {
        match cond {
            Expr::BinaryOp { left, op: ast::BinaryOperator::Eq, right } => {
                match expr_column_name(left).as_deref() {
                    Some("id") => filter = TableFilter::Id(parse_ulid_expr(right)?),
                    Some("reservation_id") if table == Table::Appointments => {
                        filter = TableFilter::Reservation(parse_ulid_expr(right)?)
                    }
                    Some(col) => return Err(SqlError::Unsupported(format!("filter on {col}"))),
                    None => return Err(SqlError::Unsupported(format!("{cond}"))),
                }
            }
            other => return Err(SqlError::Unsupported(format!("{other}"))),
        }
    }
    Ok(Command::SelectTable { table, filter })
}

fn parse_events_filters(conditions: &[&Expr]) -> Result<Command, SqlError> {
    let mut request = QueryRequest::default();
    let (mut start, mut end) = (None, None);

    for cond in conditions {
        match cond {
            Expr::BinaryOp { left, op, right } => {
                let col = expr_column_name(left);
                match (col.as_deref(), op) {
                    (Some("start"), ast::BinaryOperator::GtEq) => start = Some(parse_i64_expr(right)?),
                    (Some("end"), ast::BinaryOperator::LtEq) => end = Some(parse_i64_expr(right)?),
                    (Some("resource_id"), ast::BinaryOperator::Eq) => {
                        request.resource_ids.push(parse_ulid_expr(right)?)
                    }
                    (Some("event_type"), ast::BinaryOperator::Eq) => {
                        request.event_types.push(parse_text_expr(right)?)
                    }
                    (Some("owner"), ast::BinaryOperator::Eq) => {
                        request.owner = Some(parse_text_expr(right)?)
                    }
                    (Some("annotations"), ast::BinaryOperator::Eq) => {
                        request.annotations.extend(parse_annotations(&parse_text_expr(right)?)?)
                    }
                    _ => return Err(SqlError::Unsupported(format!("{cond}"))),
                }
            }
            Expr::InList { expr, list, negated: false } => match expr_column_name(expr).as_deref() {
                Some("resource_id") => {
                    for item in list {
                        request.resource_ids.push(parse_ulid_expr(item)?);
                    }
                }
                Some("event_type") => {
                    for item in list {
                        request.event_types.push(parse_text_expr(item)?);
                    }
                }
                _ => return Err(SqlError::Unsupported(format!("{cond}"))),
            },
            other => return Err(SqlError::Unsupported(format!("{other}"))),
        }
    }

    request.range = match (start, end) {
        (None, None) => None,
        (Some(s), Some(e)) if s < e => Some(Span::new(s, e)),
        (Some(_), Some(_)) => return Err(SqlError::Parse("start must be before end".into())),
        (None, Some(_)) => return Err(SqlError::MissingFilter("start")),
        (Some(_), None) => return Err(SqlError::MissingFilter("end")),
    };
    Ok(Command::SelectEvents { request })
}

// ── Columns ───────────────────────────────────────────────────

fn empty_payload(table: Table) -> Payload {
    match table {
        Table::Resources => Payload::Resource(Resource {
            name: String::new(),
            resource_type: String::new(),
        }),
        Table::Reservations => Payload::Reservation(Reservation {
            name: String::new(),
            event_type: String::new(),
            owner: None,
            annotations: BTreeMap::new(),
        }),
        Table::Appointments => Payload::Appointment(Appointment {
            reservation_id: Ulid::nil(),
            span: Span { start: 0, end: 0 },
            resources: Vec::new(),
            comment: None,
        }),
    }
}

fn required_columns(table: Table) -> &'static [&'static str] {
    match table {
        Table::Resources => &["name"],
        Table::Reservations => &["name"],
        Table::Appointments => &["reservation_id", "start", "end"],
    }
}

/// A copy of `payload` with `patch` applied.
pub fn apply_patch(payload: &Payload, patch: &[(String, Literal)]) -> Result<Payload, SqlError> {
    let mut next = payload.clone();
    for (column, literal) in patch {
        set_column(&mut next, column, literal.clone())?;
    }
    Ok(next)
}

fn set_column(payload: &mut Payload, column: &str, literal: Literal) -> Result<(), SqlError> {
    match payload {
        Payload::Resource(r) => match column {
            "name" => r.name = literal_text(literal)?,
            "resource_type" | "type" => r.resource_type = literal_text(literal)?,
            _ => return Err(SqlError::UnknownColumn(column.to_string())),
        },
        Payload::Reservation(r) => match column {
            "name" => r.name = literal_text(literal)?,
            "event_type" => r.event_type = literal_text(literal)?,
            "owner" => r.owner = literal_text_or_null(literal)?,
            "annotations" => {
                r.annotations = match literal_text_or_null(literal)? {
                    Some(text) => parse_annotations(&text)?,
                    None => BTreeMap::new(),
                }
            }
            _ => return Err(SqlError::UnknownColumn(column.to_string())),
        },
        Payload::Appointment(a) => match column {
            "reservation_id" => {
                a.reservation_id = literal_ulid_or_null(&literal)?
                    .ok_or(SqlError::Parse("reservation_id cannot be NULL".into()))?
            }
            "start" => a.span.start = literal_int(literal)?,
            "end" => a.span.end = literal_int(literal)?,
            "resources" => a.resources = parse_id_list(literal_text_or_null(literal)?.as_deref())?,
            "comment" => a.comment = literal_text_or_null(literal)?,
            _ => return Err(SqlError::UnknownColumn(column.to_string())),
        },
    }
    Ok(())
}

/// Annotations travel as a JSON object of strings.
pub fn parse_annotations(text: &str) -> Result<BTreeMap<String, String>, SqlError> {
    serde_json::from_str(text).map_err(|e| SqlError::Parse(format!("bad annotations: {e}")))
}

/// Resource lists travel as comma-separated ULIDs.
fn parse_id_list(text: Option<&str>) -> Result<Vec<Ulid>, SqlError> {
    let Some(text) = text else { return Ok(Vec::new()) };
    text.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}"))))
        .collect()
}

fn literal_text(literal: Literal) -> Result<String, SqlError> {
    match literal {
        Literal::Text(s) => Ok(s),
        other => Err(SqlError::Parse(format!("expected string, got {other:?}"))),
    }
}

fn literal_text_or_null(literal: Literal) -> Result<Option<String>, SqlError> {
    match literal {
        Literal::Null => Ok(None),
        other => literal_text(other).map(Some),
    }
}

fn literal_int(literal: Literal) -> Result<i64, SqlError> {
    match literal {
        Literal::Int(n) => Ok(n),
        Literal::Text(s) => s.parse().map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
        other => Err(SqlError::Parse(format!("expected number, got {other:?}"))),
    }
}

fn literal_ulid_or_null(literal: &Literal) -> Result<Option<Ulid>, SqlError> {
    match literal {
        Literal::Null => Ok(None),
        Literal::Text(s) => Ulid::from_string(s)
            .map(Some)
            .map_err(|e| SqlError::Parse(format!("bad ULID: {e}"))),
        other => Err(SqlError::Parse(format!("expected ULID, got {other:?}"))),
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_all_insert_rows(insert: &ast::Insert) -> Result<Vec<Vec<Expr>>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(values.rows.clone())
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

/// Flatten a tree of ANDs (and parentheses) into its leaves.
fn conjuncts<'a>(expr: &'a Expr, out: &mut Vec<&'a Expr>) {
    match expr {
        Expr::BinaryOp { left, op: ast::BinaryOperator::And, right } => {
            conjuncts(left, out);
            conjuncts(right, out);
        }
        Expr::Nested(inner) => conjuncts(inner, out),
        other => out.push(other),
    }
}

/// `WHERE id = … AND last_modified = …`, both required: every write names the version it read.
fn extract_version_filter(selection: &Option<Expr>) -> Result<(Ulid, Ms), SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    let mut conditions = Vec::new();
    conjuncts(sel, &mut conditions);

    let (mut id, mut expected) = (None, None);
    for cond in conditions {
        match cond {
            Expr::BinaryOp { left, op: ast::BinaryOperator::Eq, right } => {
                match expr_column_name(left).as_deref() {
                    Some("id") => id = Some(parse_ulid_expr(right)?),
                    Some("last_modified") => expected = Some(parse_i64_expr(right)?),
                    _ => return Err(SqlError::Unsupported(format!("{cond}"))),
                }
            }
            other => return Err(SqlError::Unsupported(format!("{other}"))),
        }
    }
    Ok((
        id.ok_or(SqlError::MissingFilter("id"))?,
        expected.ok_or(SqlError::MissingFilter("last_modified"))?,
    ))
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn parse_literal(expr: &Expr) -> Result<Literal, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Null => Ok(Literal::Null),
            Value::Boolean(b) => Ok(Literal::Bool(*b)),
            Value::SingleQuotedString(s) => Ok(Literal::Text(s.clone())),
            Value::Number(n, _) => n
                .parse()
                .map(Literal::Int)
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("unsupported literal {value:?}"))),
        }
    } else if let Expr::UnaryOp { op: ast::UnaryOperator::Minus, .. } = expr {
        parse_i64_expr(expr).map(Literal::Int)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_text_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        _ => Err(SqlError::Parse(format!("expected string, got {expr:?}"))),
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) | Value::Number(s, _) => {
                Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
            }
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
    MissingColumn(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::MissingColumn(col) => write!(f, "missing column: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
    const ROOM: &str = "01BX5ZZKBKACTAV9WEVGEMMVRZ";

    #[test]
    fn parse_insert_resource() {
        let sql = format!("INSERT INTO resources (id, name, resource_type) VALUES ('{ID}', 'Room 1', 'room')");
        match parse_sql(&sql).unwrap() {
            Command::Insert { table: Table::Resources, rows, returning } => {
                assert!(!returning);
                assert_eq!(rows.len(), 1);
                assert_eq!(rows[0].id.unwrap().to_string(), ID);
                assert_eq!(
                    rows[0].payload,
                    Payload::Resource(Resource { name: "Room 1".into(), resource_type: "room".into() })
                );
            }
            other => panic!("expected resource insert, got {other:?}"),
        }
    }

    #[test]
    fn parse_insert_without_id_leaves_allocation_to_server() {
        let sql = "INSERT INTO reservations (name, event_type, annotations) VALUES ('Algebra', 'lecture', '{\"public\":\"true\"}') RETURNING *";
        match parse_sql(sql).unwrap() {
            Command::Insert { table: Table::Reservations, rows, returning } => {
                assert!(returning);
                assert_eq!(rows[0].id, None);
                let Payload::Reservation(r) = &rows[0].payload else { panic!("not a reservation") };
                assert_eq!(r.event_type, "lecture");
                assert_eq!(r.owner, None);
                assert_eq!(r.annotations.get("public").map(String::as_str), Some("true"));
            }
            other => panic!("expected reservation insert, got {other:?}"),
        }
    }

    #[test]
    fn parse_multi_row_appointment_insert() {
        let sql = format!(
            r#"INSERT INTO appointments (reservation_id, start, "end", resources) VALUES ('{ID}', 1000, 2000, '{ROOM}'), ('{ID}', 3000, 4000, '')"#
        );
        match parse_sql(&sql).unwrap() {
            Command::Insert { table: Table::Appointments, rows, .. } => {
                assert_eq!(rows.len(), 2);
                let Payload::Appointment(a) = &rows[0].payload else { panic!("not an appointment") };
                assert_eq!(a.span, Span::new(1000, 2000));
                assert_eq!(a.resources, vec![Ulid::from_string(ROOM).unwrap()]);
                let Payload::Appointment(b) = &rows[1].payload else { panic!("not an appointment") };
                assert!(b.resources.is_empty());
            }
            other => panic!("expected appointment insert, got {other:?}"),
        }
    }

    #[test]
    fn appointment_comment_is_optional_text() {
        let sql = format!(
            r#"INSERT INTO appointments (reservation_id, start, "end", comment) VALUES ('{ID}', 1000, 2000, 'bring slides')"#
        );
        let Command::Insert { rows, .. } = parse_sql(&sql).unwrap() else { panic!("not an insert") };
        let Payload::Appointment(a) = &rows[0].payload else { panic!("not an appointment") };
        assert_eq!(a.comment.as_deref(), Some("bring slides"));

        let cleared = apply_patch(
            &rows[0].payload,
            &[("comment".to_string(), Literal::Null)],
        )
        .unwrap();
        let Payload::Appointment(b) = cleared else { panic!("not an appointment") };
        assert_eq!(b.comment, None);
    }

    #[test]
    fn insert_missing_required_column() {
        let sql = format!("INSERT INTO appointments (reservation_id, start) VALUES ('{ID}', 1000)");
        assert!(matches!(parse_sql(&sql), Err(SqlError::MissingColumn("end"))));
    }

    #[test]
    fn insert_unknown_column() {
        let sql = "INSERT INTO resources (name, colour) VALUES ('Room 1', 'red')";
        assert!(matches!(parse_sql(sql), Err(SqlError::UnknownColumn(_))));
    }

    #[test]
    fn parse_update_with_version() {
        let sql = format!("UPDATE reservations SET name = 'Linear algebra', owner = NULL WHERE id = '{ID}' AND last_modified = 1700000000000");
        match parse_sql(&sql).unwrap() {
            Command::Update { table, id, expected, patch, returning } => {
                assert!(!returning);
                assert_eq!(table, Table::Reservations);
                assert_eq!(id.to_string(), ID);
                assert_eq!(expected, 1_700_000_000_000);
                assert_eq!(
                    patch,
                    vec![
                        ("name".to_string(), Literal::Text("Linear algebra".into())),
                        ("owner".to_string(), Literal::Null),
                    ]
                );
            }
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[test]
    fn update_requires_version() {
        let sql = format!("UPDATE resources SET name = 'x' WHERE id = '{ID}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::MissingFilter("last_modified"))));
    }

    #[test]
    fn update_rejects_stamp_assignment() {
        let sql = format!("UPDATE resources SET last_modified = 5 WHERE id = '{ID}' AND last_modified = 4");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_delete_with_version() {
        let sql = format!("DELETE FROM appointments WHERE (id = '{ID}') AND last_modified = 42");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::Delete {
                table: Table::Appointments,
                id: Ulid::from_string(ID).unwrap(),
                expected: 42,
            }
        );
    }

    #[test]
    fn parse_select_events() {
        let sql = format!(
            r#"SELECT * FROM events WHERE start >= 1000 AND "end" <= 2000 AND resource_id IN ('{ROOM}') AND event_type = 'lecture'"#
        );
        match parse_sql(&sql).unwrap() {
            Command::SelectEvents { request } => {
                assert_eq!(request.range, Some(Span::new(1000, 2000)));
                assert_eq!(request.resource_ids, vec![Ulid::from_string(ROOM).unwrap()]);
                assert_eq!(request.event_types, vec!["lecture".to_string()]);
            }
            other => panic!("expected events query, got {other:?}"),
        }
    }

    #[test]
    fn events_without_filters_is_unbounded() {
        match parse_sql("SELECT * FROM events").unwrap() {
            Command::SelectEvents { request } => assert_eq!(request, QueryRequest::default()),
            other => panic!("expected events query, got {other:?}"),
        }
    }

    #[test]
    fn events_half_open_range_rejected() {
        assert!(matches!(
            parse_sql("SELECT * FROM events WHERE start >= 1000"),
            Err(SqlError::MissingFilter("end"))
        ));
        assert!(parse_sql(r#"SELECT * FROM events WHERE start >= 2000 AND "end" <= 1000"#).is_err());
    }

    #[test]
    fn parse_select_table_filters() {
        assert_eq!(
            parse_sql("SELECT * FROM resources").unwrap(),
            Command::SelectTable { table: Table::Resources, filter: TableFilter::All }
        );
        let sql = format!("SELECT * FROM appointments WHERE reservation_id = '{ID}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectTable {
                table: Table::Appointments,
                filter: TableFilter::Reservation(Ulid::from_string(ID).unwrap()),
            }
        );
    }

    #[test]
    fn apply_patch_keeps_untouched_columns() {
        let before = Payload::Resource(Resource { name: "Room 1".into(), resource_type: "room".into() });
        let after = apply_patch(&before, &[("name".into(), Literal::Text("Room 2".into()))]).unwrap();
        assert_eq!(
            after,
            Payload::Resource(Resource { name: "Room 2".into(), resource_type: "room".into() })
        );
    }

    #[test]
    fn parse_unknown_table_errors() {
        let sql = format!("INSERT INTO foobar (id) VALUES ('{ID}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownTable(_))));
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }
}
