//! Static description of the queryable record tables
//!
//! The descriptor is the single source of truth for what the assistant may read:
//! the prompt lists it, the SQL guard derives its allow-list from it, and the
//! response synthesizer uses the semantic types to format answers.
use serde::{Deserialize, Serialize};

/// Meaning of a column's values, used for prompt hints and answer formatting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SemanticType {
    Identifier,
    Text,
    Category,
    /// ISO `YYYY-MM-DD` stored as TEXT
    Date,
    Currency,
    /// Fractional day counts (leave, overseas days)
    Days,
    Count,
    Integer,
    /// 0/1 boolean stored as INTEGER
    Flag,
    Status,
}

impl SemanticType {
    pub fn label(&self) -> &'static str {
        match self {
            SemanticType::Identifier => "id",
            SemanticType::Text => "text",
            SemanticType::Category => "category",
            SemanticType::Date => "date YYYY-MM-DD",
            SemanticType::Currency => "money",
            SemanticType::Days => "days",
            SemanticType::Count => "count",
            SemanticType::Integer => "integer",
            SemanticType::Flag => "0/1 flag",
            SemanticType::Status => "status",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    pub semantic: SemanticType,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub name: String,
    pub description: String,
    pub columns: Vec<ColumnDescriptor>,
}

impl TableDescriptor {
    pub fn new(name: &str, description: &str, columns: Vec<ColumnDescriptor>) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            columns,
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }
}

fn col(name: &str, semantic: SemanticType, description: &str) -> ColumnDescriptor {
    ColumnDescriptor {
        name: name.to_string(),
        semantic,
        description: description.to_string(),
    }
}

/// Versioned, immutable table/column catalogue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaDescriptor {
    version: u32,
    tables: Vec<TableDescriptor>,
}

impl SchemaDescriptor {
    pub fn new(version: u32, tables: Vec<TableDescriptor>) -> Self {
        Self { version, tables }
    }

    /// The record tables owned by the dashboard's data-entry modules.
    pub fn personal_records() -> Self {
        use SemanticType::*;

        let tables = vec![
            TableDescriptor::new(
                "expenses",
                "one row per expense",
                vec![
                    col("id", Identifier, "row id"),
                    col("date", Date, "day the money was spent"),
                    col("category", Category, "spending category, e.g. 'Food', 'Transport', 'Bills'"),
                    col("description", Text, "free-text note"),
                    col("amount", Currency, "amount spent; use SUM(amount) for totals"),
                ],
            ),
            TableDescriptor::new(
                "loans_master",
                "loan terms, one row per loan",
                vec![
                    col("id", Identifier, "loan id, referenced by loan_payments.loan_id"),
                    col("description", Text, "loan name"),
                    col("total_amount", Currency, "principal borrowed"),
                    col("monthly_payment", Currency, "scheduled monthly installment"),
                    col("start_date", Date, "first installment month"),
                    col("duration_months", Count, "number of installments"),
                    col("due_day", Integer, "day of month the installment is due"),
                    col("status", Status, "'Ongoing' or 'Finished'"),
                ],
            ),
            TableDescriptor::new(
                "loan_payments",
                "installments actually paid",
                vec![
                    col("id", Identifier, "row id"),
                    col("loan_id", Identifier, "JOIN loans_master ON loans_master.id = loan_payments.loan_id"),
                    col("payment_date", Date, "day the installment was paid"),
                    col("amount_paid", Currency, "amount paid; SUM(amount_paid) for paid-to-date"),
                ],
            ),
            TableDescriptor::new(
                "leave_logs",
                "leave taken",
                vec![
                    col("id", Identifier, "row id"),
                    col("date", Date, "first day of leave"),
                    col("days", Days, "days of leave taken; SUM(days) for totals"),
                    col("description", Text, "reason"),
                ],
            ),
            TableDescriptor::new(
                "documents",
                "personal documents with expiry dates",
                vec![
                    col("id", Identifier, "row id"),
                    col("name", Text, "document name, e.g. 'Passport'"),
                    col("expiry_date", Date, "expiry day; ORDER BY expiry_date ASC LIMIT 1 for soonest"),
                ],
            ),
            TableDescriptor::new(
                "allowance_logs",
                "overseas/overtime allowance claims",
                vec![
                    col("id", Identifier, "row id"),
                    col("date", Date, "day the claim was logged"),
                    col("start_date", Date, "trip start"),
                    col("end_date", Date, "trip end"),
                    col("overseas_days", Days, "days worked overseas"),
                    col("overtime_days", Days, "weekend/overtime days"),
                    col("allowance_amount", Currency, "overseas allowance earned"),
                    col("overtime_amount", Currency, "overtime pay earned"),
                    col("total_earned", Currency, "allowance_amount + overtime_amount"),
                ],
            ),
            TableDescriptor::new(
                "tasks",
                "to-do items",
                vec![
                    col("id", Identifier, "row id"),
                    col("task", Text, "task text"),
                    col("done", Flag, "1 when completed, 0 when open"),
                ],
            ),
        ];

        Self::new(1, tables)
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn tables(&self) -> &[TableDescriptor] {
        &self.tables
    }

    pub fn table(&self, name: &str) -> Option<&TableDescriptor> {
        self.tables.iter().find(|t| t.name.eq_ignore_ascii_case(name))
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.table(name).is_some()
    }

    /// True when any table declares a column with this name.
    pub fn has_column(&self, name: &str) -> bool {
        self.tables.iter().any(|t| t.column(name).is_some())
    }

    /// Semantic type for a bare column name, first declaring table wins.
    pub fn column_semantic(&self, name: &str) -> Option<SemanticType> {
        self.tables
            .iter()
            .find_map(|t| t.column(name))
            .map(|c| c.semantic)
    }

    /// Compact `table(col, ...)` listing with one line of semantics per column.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        for table in &self.tables {
            out.push_str(&format!(
                "{}({}) -- {}\n",
                table.name,
                table.column_names().join(", "),
                table.description
            ));
            for column in &table.columns {
                out.push_str(&format!(
                    "  {}.{}: {}; {}\n",
                    table.name,
                    column.name,
                    column.semantic.label(),
                    column.description
                ));
            }
        }
        out
    }
}

impl Default for SchemaDescriptor {
    fn default() -> Self {
        Self::personal_records()
    }
}
