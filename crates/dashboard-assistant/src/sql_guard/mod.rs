//! SQL guard - the only component allowed to authorize execution
//!
//! Model output is untrusted. A candidate statement passes only if, in order:
//! 1. it is exactly one statement,
//! 2. it is a read-only query,
//! 3. every name in table position is an allow-listed table or an earlier CTE,
//!    and every column reference resolves to an allow-listed column or to an
//!    alias visible at that position,
//! 4. every function call, bare or quoted, targets an allow-listed function.
//! The first failing check rejects the statement; nothing is rewritten.
pub mod tokenizer;

use crate::error::{GuardError, GuardReason};
use crate::schema::SchemaDescriptor;
use lazy_static::lazy_static;
use std::collections::{HashMap, HashSet};
use tokenizer::{tokenize, Spanned, Token};
use tracing::{debug, warn};

lazy_static! {
    static ref KEYWORDS: HashSet<&'static str> = [
        "SELECT", "DISTINCT", "ALL", "FROM", "WHERE", "AND", "OR", "NOT", "IN", "IS", "NULL",
        "LIKE", "GLOB", "BETWEEN", "EXISTS", "CASE", "WHEN", "THEN", "ELSE", "END", "AS", "ON",
        "USING", "JOIN", "INNER", "LEFT", "RIGHT", "FULL", "OUTER", "CROSS", "NATURAL", "GROUP",
        "BY", "HAVING", "ORDER", "ASC", "DESC", "LIMIT", "OFFSET", "UNION", "INTERSECT",
        "EXCEPT", "WITH", "RECURSIVE", "CAST", "COLLATE", "NOCASE", "ESCAPE", "TRUE", "FALSE",
        "CURRENT_DATE", "CURRENT_TIME", "CURRENT_TIMESTAMP", "INTEGER", "INT", "REAL", "TEXT",
        "NUMERIC", "BLOB", "FLOAT", "DECIMAL", "OVER", "PARTITION", "FILTER", "ROWS", "RANGE",
        "UNBOUNDED", "PRECEDING", "FOLLOWING", "CURRENT", "ROW", "NULLS", "FIRST", "LAST",
        "ISNULL", "NOTNULL",
    ]
    .into_iter()
    .collect();

    static ref MUTATING_KEYWORDS: HashSet<&'static str> = [
        "INSERT", "UPDATE", "DELETE", "DROP", "ATTACH", "DETACH", "CREATE", "ALTER", "REPLACE",
        "PRAGMA", "VACUUM", "REINDEX", "ANALYZE", "TRUNCATE", "BEGIN", "COMMIT", "ROLLBACK",
        "SAVEPOINT", "RELEASE", "INTO", "UPSERT",
    ]
    .into_iter()
    .collect();

    static ref DEFAULT_FUNCTIONS: Vec<&'static str> = vec![
        "SUM", "COUNT", "AVG", "MIN", "MAX", "TOTAL", "GROUP_CONCAT", "ROUND", "ABS",
        "COALESCE", "IFNULL", "NULLIF", "IIF", "SUBSTR", "SUBSTRING", "STRFTIME", "DATE",
        "TIME", "DATETIME", "JULIANDAY", "LOWER", "UPPER", "LENGTH", "TRIM", "LTRIM", "RTRIM",
        "INSTR",
    ];
}

fn is_keyword(word: &str) -> bool {
    KEYWORDS.contains(word.to_ascii_uppercase().as_str())
}

/// Statement validator built from the schema allow-list
#[derive(Debug, Clone)]
pub struct SqlGuard {
    tables: HashMap<String, HashSet<String>>,
    columns: HashSet<String>,
    functions: HashSet<String>,
}

/// Clause a token belongs to, tracked per parenthesis level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Clause {
    With,
    Select,
    From,
    Where,
    Group,
    Having,
    Order,
    Other,
}

#[derive(Debug, Clone)]
struct Frame {
    clause: Clause,
    /// The next identifier names a table source.
    expect_source: bool,
    /// Set right after a source; holds the allow-listed table it reads, or
    /// `None` for a CTE or subquery.
    after_source: Option<Option<String>>,
    /// Parenthesis opened where a table source was expected
    source_paren: bool,
}

impl Frame {
    fn new(clause: Clause) -> Self {
        Self {
            clause,
            expect_source: false,
            after_source: None,
            source_paren: false,
        }
    }

    fn source_paren() -> Self {
        Self {
            clause: Clause::From,
            expect_source: true,
            after_source: None,
            source_paren: true,
        }
    }

    fn enter(&mut self, clause: Clause) {
        self.clause = clause;
        self.clear();
    }

    fn clear(&mut self) {
        self.expect_source = false;
        self.after_source = None;
    }
}

/// Names a statement introduces for itself
#[derive(Debug, Default)]
struct Scope {
    ctes: HashSet<String>,
    /// Source name or alias to the table it reads (`None` for CTEs and subqueries)
    sources: HashMap<String, Vec<Option<String>>>,
    /// Select-list alias to the deepest nesting level defining it
    outputs: HashMap<String, usize>,
}

impl Scope {
    fn add_source(&mut self, name: String, target: Option<String>) {
        self.sources.entry(name).or_default().push(target);
    }

    fn add_output(&mut self, name: String, depth: usize) {
        let level = self.outputs.entry(name).or_insert(depth);
        *level = (*level).max(depth);
    }
}

/// Column reference checked once every source and alias is known
#[derive(Debug)]
enum Reference {
    Column {
        written: String,
        depth: usize,
        clause: Clause,
    },
    Qualified {
        qualifier: String,
        written: String,
        member: Option<String>,
    },
}

impl SqlGuard {
    pub fn new(schema: &SchemaDescriptor) -> Self {
        let mut tables = HashMap::new();
        let mut columns = HashSet::new();
        for table in schema.tables() {
            let names: HashSet<String> = table
                .columns
                .iter()
                .map(|c| c.name.to_ascii_lowercase())
                .collect();
            columns.extend(names.iter().cloned());
            tables.insert(table.name.to_ascii_lowercase(), names);
        }

        Self {
            tables,
            columns,
            functions: DEFAULT_FUNCTIONS.iter().map(|f| f.to_string()).collect(),
        }
    }

    pub fn is_function_allowed(&self, name: &str) -> bool {
        self.functions.contains(&name.to_ascii_uppercase())
    }

    /// Authorize `raw` for execution, returning the statement without trailing
    /// terminators or surrounding comments.
    pub fn validate(&self, raw: &str) -> Result<String, GuardError> {
        let result = self.check(raw);
        match &result {
            Ok(sql) => debug!("Guard accepted: {}", sql),
            Err(e) => warn!("Guard rejected candidate ({}): {}", e, raw.trim()),
        }
        result
    }

    fn check(&self, raw: &str) -> Result<String, GuardError> {
        if raw.trim().is_empty() {
            return Err(GuardError::new(GuardReason::Empty, "no statement"));
        }

        let mut tokens = tokenize(raw)?;
        while tokens.last().is_some_and(|t| t.token.is_symbol(';')) {
            tokens.pop();
        }
        let (Some(first), Some(last)) = (tokens.first(), tokens.last()) else {
            return Err(GuardError::new(GuardReason::Empty, "no statement"));
        };
        let (start, end) = (first.start, last.end);

        if tokens.iter().any(|t| t.token.is_symbol(';')) {
            return Err(GuardError::new(
                GuardReason::MultipleStatements,
                "only one statement may be submitted",
            ));
        }

        Self::check_read_only(&tokens)?;
        self.check_references(&tokens)?;

        Ok(raw[start..end].to_string())
    }

    fn check_read_only(tokens: &[Spanned]) -> Result<(), GuardError> {
        for spanned in tokens {
            if let Token::Word(word) = &spanned.token {
                let upper = word.to_ascii_uppercase();
                if MUTATING_KEYWORDS.contains(upper.as_str()) {
                    return Err(GuardError::new(
                        GuardReason::NotReadOnly,
                        format!("keyword {} is not allowed", upper),
                    ));
                }
            }
        }

        let leading = &tokens[0].token;
        if !(leading.is_word("SELECT") || leading.is_word("WITH")) {
            let shown = leading.ident().unwrap_or("?").to_ascii_uppercase();
            return Err(GuardError::new(
                GuardReason::NotReadOnly,
                format!("statement must start with SELECT or WITH, found {}", shown),
            ));
        }
        Ok(())
    }

    /// Walk the statement once, classifying each identifier by its position.
    /// Table sources and function calls fail on the spot; column references
    /// are resolved after the walk, when every alias is known.
    fn check_references(&self, tokens: &[Spanned]) -> Result<(), GuardError> {
        let at = |i: usize| tokens.get(i).map(|t| &t.token);
        let mut stack = vec![Frame::new(Clause::Other)];
        let mut scope = Scope::default();
        let mut deferred = Vec::new();
        let mut i = 0;

        while i < tokens.len() {
            let token = &tokens[i].token;
            let depth = stack.len() - 1;

            if token.is_symbol('(') {
                let frame = &mut stack[depth];
                let opened = if frame.expect_source {
                    Frame::source_paren()
                } else {
                    Frame::new(frame.clause)
                };
                frame.clear();
                stack.push(opened);
                i += 1;
                continue;
            }

            if token.is_symbol(')') {
                if depth == 0 {
                    return Err(GuardError::new(GuardReason::Lexical, "unbalanced parenthesis"));
                }
                let closed = stack.pop();
                if closed.is_some_and(|f| f.source_paren) {
                    stack[depth - 1].after_source = Some(None);
                }
                i += 1;
                continue;
            }

            let frame = &mut stack[depth];

            if token.is_symbol(',') {
                frame.clear();
                frame.expect_source = frame.clause == Clause::From;
                i += 1;
                continue;
            }

            if let Token::Word(word) = token {
                if is_keyword(word) {
                    match word.to_ascii_uppercase().as_str() {
                        "AS" => {
                            let alias = definable(at(i + 1))
                                .filter(|_| !at(i + 2).is_some_and(|t| t.is_symbol('(')));
                            if let Some(alias) = alias {
                                let alias = alias.to_ascii_lowercase();
                                match frame.after_source.take() {
                                    Some(target) => scope.add_source(alias, target),
                                    None => scope.add_output(alias, depth),
                                }
                                frame.clear();
                                i += 2;
                                continue;
                            }
                            frame.clear();
                        }
                        "IN" => {
                            frame.clear();
                            let table = definable(at(i + 1))
                                .filter(|_| !at(i + 2).is_some_and(|t| t.is_symbol('(')));
                            if let Some(table) = table {
                                self.check_source(&scope, table, at(i + 2))?;
                                i += 2;
                                continue;
                            }
                        }
                        "SELECT" => frame.enter(Clause::Select),
                        "FROM" | "JOIN" => {
                            frame.enter(Clause::From);
                            frame.expect_source = true;
                        }
                        "WHERE" => frame.enter(Clause::Where),
                        "GROUP" => frame.enter(Clause::Group),
                        "HAVING" => frame.enter(Clause::Having),
                        "ORDER" => frame.enter(Clause::Order),
                        "WITH" => frame.enter(Clause::With),
                        "ON" | "USING" | "LIMIT" | "OFFSET" | "UNION" | "INTERSECT" | "EXCEPT" => {
                            frame.enter(Clause::Other)
                        }
                        _ => frame.clear(),
                    }
                    i += 1;
                    continue;
                }
            }

            let Some(name) = token.ident() else {
                frame.clear();
                i += 1;
                continue;
            };
            let lower = name.to_ascii_lowercase();
            let next = at(i + 1);

            if next.is_some_and(|t| t.is_symbol('(')) {
                if !self.is_function_allowed(name) {
                    return Err(GuardError::new(
                        GuardReason::DisallowedFunction,
                        format!("{}()", name),
                    ));
                }
                frame.clear();
                i += 1;
                continue;
            }

            // name AS ( ... )
            if frame.clause == Clause::With
                && next.is_some_and(|t| t.is_word("AS"))
                && at(i + 2).is_some_and(|t| t.is_symbol('('))
            {
                scope.ctes.insert(lower);
                i += 2;
                continue;
            }

            if frame.expect_source {
                let target = self.check_source(&scope, name, next)?;
                scope.add_source(lower, target.clone());
                frame.expect_source = false;
                frame.after_source = Some(target);
                i += 1;
                continue;
            }

            if next.is_some_and(|t| t.is_symbol('.')) {
                let member = match at(i + 2) {
                    Some(Token::Symbol('*')) => None,
                    Some(t) if t.ident().is_some() => t.ident().map(str::to_string),
                    _ => {
                        return Err(GuardError::new(
                            GuardReason::Lexical,
                            format!("expected column after {}.", name),
                        ))
                    }
                };
                deferred.push(Reference::Qualified {
                    qualifier: lower,
                    written: name.to_string(),
                    member,
                });
                frame.clear();
                i += 3;
                continue;
            }

            // Implicit source alias: FROM expenses e
            if let Some(target) = frame.after_source.take() {
                scope.add_source(lower, target);
                i += 1;
                continue;
            }

            // Implicit output alias: SELECT SUM(amount) total
            let previous = i.checked_sub(1).and_then(at);
            if frame.clause == Clause::Select && ends_operand(previous) {
                scope.add_output(lower, depth);
                i += 1;
                continue;
            }

            deferred.push(Reference::Column {
                written: name.to_string(),
                depth,
                clause: frame.clause,
            });
            i += 1;
        }

        if stack.len() != 1 {
            return Err(GuardError::new(GuardReason::Lexical, "unbalanced parenthesis"));
        }

        for reference in &deferred {
            self.resolve(reference, &scope)?;
        }
        Ok(())
    }

    /// A table source must be a CTE declared earlier or an allow-listed table.
    fn check_source(&self, scope: &Scope, name: &str, next: Option<&Token>) -> Result<Option<String>, GuardError> {
        if next.is_some_and(|t| t.is_symbol('.')) {
            return Err(GuardError::new(GuardReason::UnknownTable, format!("{}.", name)));
        }
        let lower = name.to_ascii_lowercase();
        if scope.ctes.contains(&lower) {
            Ok(None)
        } else if self.tables.contains_key(&lower) {
            Ok(Some(lower))
        } else {
            Err(GuardError::new(GuardReason::UnknownTable, name))
        }
    }

    fn resolve(&self, reference: &Reference, scope: &Scope) -> Result<(), GuardError> {
        match reference {
            Reference::Column { written, depth, clause } => {
                let lower = written.to_ascii_lowercase();
                if self.columns.contains(&lower) {
                    return Ok(());
                }
                // Select-list aliases are visible to ORDER/GROUP BY and HAVING,
                // or as columns of an enclosing query.
                let aliased = scope.outputs.get(&lower).is_some_and(|defined| {
                    matches!(clause, Clause::Group | Clause::Having | Clause::Order) || defined > depth
                });
                if aliased {
                    Ok(())
                } else {
                    Err(GuardError::new(GuardReason::UnknownColumn, written.as_str()))
                }
            }
            Reference::Qualified { qualifier, written, member } => {
                let targets = match scope.sources.get(qualifier) {
                    Some(targets) => targets.clone(),
                    None if scope.ctes.contains(qualifier) => vec![None],
                    None if self.tables.contains_key(qualifier) => vec![Some(qualifier.clone())],
                    None => return Err(GuardError::new(GuardReason::UnknownTable, written.as_str())),
                };
                let Some(member) = member else {
                    return Ok(());
                };
                let lower = member.to_ascii_lowercase();
                let found = targets.iter().any(|target| match target {
                    Some(table) => self.tables.get(table).is_some_and(|columns| columns.contains(&lower)),
                    None => self.columns.contains(&lower) || scope.outputs.contains_key(&lower),
                });
                if found {
                    Ok(())
                } else {
                    Err(GuardError::new(
                        GuardReason::UnknownColumn,
                        format!("{}.{}", written, member),
                    ))
                }
            }
        }
    }
}

/// Identifier that can name an alias or table: quoted, or a bare non-keyword.
fn definable(token: Option<&Token>) -> Option<&str> {
    match token? {
        Token::QuotedIdent(name) => Some(name.as_str()),
        Token::Word(word) if !is_keyword(word) => Some(word.as_str()),
        _ => None,
    }
}

fn ends_operand(token: Option<&Token>) -> bool {
    match token {
        Some(Token::Word(word)) => {
            !is_keyword(word)
                || ["END", "NULL", "TRUE", "FALSE", "CURRENT_DATE", "CURRENT_TIME", "CURRENT_TIMESTAMP"]
                    .iter()
                    .any(|k| word.eq_ignore_ascii_case(k))
        }
        Some(Token::QuotedIdent(_) | Token::Number(_) | Token::Str(_)) => true,
        Some(token) => token.is_symbol(')'),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn guard() -> SqlGuard {
        SqlGuard::new(&SchemaDescriptor::personal_records())
    }

    fn reason(sql: &str) -> GuardReason {
        guard().validate(sql).unwrap_err().reason
    }

    #[test]
    fn test_accepts_aggregate_query() {
        let sql = "SELECT SUM(amount) AS total_amount FROM expenses \
                   WHERE category = 'Food' AND SUBSTR(date, 1, 7) = '2025-02';";
        let accepted = guard().validate(sql).unwrap();
        assert!(accepted.ends_with("'2025-02'"));
    }

    #[test]
    fn test_strips_trailing_terminators_and_comments() {
        let accepted = guard()
            .validate("  SELECT COUNT(*) AS open_tasks FROM tasks WHERE done = 0 ;; -- done\n")
            .unwrap();
        assert_eq!(accepted, "SELECT COUNT(*) AS open_tasks FROM tasks WHERE done = 0");
    }

    #[test]
    fn test_accepts_join_with_aliases() {
        let sql = "SELECT l.description, SUM(p.amount_paid) AS paid \
                   FROM loans_master l JOIN loan_payments p ON p.loan_id = l.id \
                   GROUP BY l.description ORDER BY paid DESC";
        assert!(guard().validate(sql).is_ok());
    }

    #[test]
    fn test_accepts_cte_and_subquery() {
        let sql = "WITH monthly AS (SELECT SUBSTR(date, 1, 7) AS month, SUM(amount) AS total \
                   FROM expenses GROUP BY month) \
                   SELECT m.month, m.total FROM monthly m ORDER BY m.total DESC LIMIT 1";
        assert!(guard().validate(sql).is_ok());

        let sql = "SELECT name FROM documents WHERE expiry_date = (SELECT MIN(expiry_date) FROM documents)";
        assert!(guard().validate(sql).is_ok());
    }

    #[test]
    fn test_accepts_case_and_cast() {
        let sql = "SELECT CASE WHEN done = 1 THEN 'done' ELSE 'open' END AS state, \
                   CAST(COUNT(*) AS INTEGER) AS n FROM tasks GROUP BY state";
        assert!(guard().validate(sql).is_ok());
    }

    #[test]
    fn test_keywords_inside_strings_are_data() {
        let sql = "SELECT amount FROM expenses WHERE description = 'DROP TABLE; DELETE'";
        assert!(guard().validate(sql).is_ok());
    }

    #[test]
    fn test_rejects_empty() {
        assert_eq!(reason("   "), GuardReason::Empty);
        assert_eq!(reason(" ; ;"), GuardReason::Empty);
        assert_eq!(reason("-- nothing here"), GuardReason::Empty);
    }

    #[test]
    fn test_rejects_multiple_statements_before_verb_check() {
        assert_eq!(reason("SELECT * FROM expenses; DELETE FROM expenses"), GuardReason::MultipleStatements);
        assert_eq!(reason("SELECT 1; SELECT 2"), GuardReason::MultipleStatements);
    }

    #[test]
    fn test_rejects_mutations() {
        for sql in [
            "DROP TABLE expenses;",
            "INSERT INTO expenses (date, category, amount) VALUES ('2025-01-01', 'Food', 1)",
            "UPDATE expenses SET amount = 0",
            "DELETE FROM expenses",
            "ATTACH DATABASE '/tmp/x.db' AS x",
            "PRAGMA table_info(expenses)",
            "REPLACE INTO tasks (task, done) VALUES ('x', 0)",
            "WITH t AS (SELECT 1) DELETE FROM expenses",
            "CREATE TABLE x (id INTEGER)",
            "VACUUM",
        ] {
            assert_eq!(reason(sql), GuardReason::NotReadOnly, "{}", sql);
        }
    }

    #[test]
    fn test_rejects_comment_obfuscation() {
        assert_eq!(reason("SELECT 1 FROM expenses /* x */ ; /**/DROP/**/TABLE expenses"), GuardReason::MultipleStatements);
        assert_eq!(reason("DR/**/OP TABLE expenses"), GuardReason::NotReadOnly);
        // Commented-out text never reaches the store.
        let accepted = guard().validate("SELECT amount FROM expenses -- ; DROP TABLE expenses").unwrap();
        assert_eq!(accepted, "SELECT amount FROM expenses");
    }

    #[test]
    fn test_rejects_unknown_table() {
        assert_eq!(reason("SELECT * FROM salaries"), GuardReason::UnknownTable);
        assert_eq!(reason("SELECT name FROM sqlite_master"), GuardReason::UnknownTable);
        assert_eq!(reason("SELECT x.amount FROM expenses e"), GuardReason::UnknownTable);
        assert_eq!(reason("SELECT * FROM expenses JOIN settings ON 1 = 1"), GuardReason::UnknownTable);
    }

    #[test]
    fn test_rejects_unknown_column() {
        assert_eq!(reason("SELECT salary FROM expenses"), GuardReason::UnknownColumn);
        assert_eq!(reason("SELECT expenses.salary FROM expenses"), GuardReason::UnknownColumn);
        assert_eq!(reason("SELECT e.salary FROM expenses e"), GuardReason::UnknownColumn);
        assert_eq!(reason("SELECT \"secret\" FROM expenses"), GuardReason::UnknownColumn);
        // Column exists, but not on that table.
        assert_eq!(reason("SELECT expenses.expiry_date FROM expenses"), GuardReason::UnknownColumn);
    }

    #[test]
    fn test_rejects_disallowed_functions() {
        assert_eq!(reason("SELECT load_extension('/tmp/evil.so')"), GuardReason::DisallowedFunction);
        assert_eq!(reason("SELECT RANDOMBLOB(8) FROM expenses"), GuardReason::DisallowedFunction);
        assert_eq!(reason("SELECT readfile('/etc/passwd') AS f FROM expenses"), GuardReason::DisallowedFunction);
    }

    #[test]
    fn test_rejects_quoted_function_names() {
        assert_eq!(
            reason("SELECT \"randomblob\"(8) AS \"randomblob\" FROM expenses"),
            GuardReason::DisallowedFunction
        );
        assert_eq!(reason("SELECT [load_extension]('x') FROM expenses"), GuardReason::DisallowedFunction);
        assert_eq!(reason("SELECT `readfile`('/etc/passwd') AS f FROM expenses"), GuardReason::DisallowedFunction);
        assert!(guard().validate("SELECT \"SUM\"(amount) AS total FROM expenses").is_ok());
    }

    #[test]
    fn test_aliases_do_not_admit_unknown_tables() {
        for sql in [
            "SELECT sql AS sql FROM sqlite_master AS sqlite_master",
            "SELECT secret AS secret FROM salaries AS salaries",
            "SELECT v AS v FROM settings AS settings",
            "SELECT v FROM settings settings",
            "SELECT amount AS settings FROM expenses JOIN settings ON 1 = 1",
        ] {
            assert_eq!(reason(sql), GuardReason::UnknownTable, "{}", sql);
        }
    }

    #[test]
    fn test_select_aliases_are_not_columns_of_the_source() {
        assert_eq!(reason("SELECT secret AS secret FROM expenses"), GuardReason::UnknownColumn);
        assert_eq!(reason("SELECT amount AS total FROM expenses WHERE total > 10"), GuardReason::UnknownColumn);
        assert_eq!(reason("SELECT amount total FROM expenses WHERE total > 10"), GuardReason::UnknownColumn);
        // Only a table source alias can qualify a column.
        assert_eq!(reason("SELECT amount AS e FROM expenses ORDER BY e.amount"), GuardReason::UnknownTable);
        assert!(guard()
            .validate("SELECT category, SUM(amount) total FROM expenses GROUP BY category HAVING total > 10 ORDER BY total")
            .is_ok());
    }

    #[test]
    fn test_rejects_tables_in_other_source_positions() {
        assert_eq!(reason("SELECT amount FROM expenses WHERE category IN settings"), GuardReason::UnknownTable);
        assert_eq!(reason("SELECT * FROM (sqlite_master)"), GuardReason::UnknownTable);
        assert_eq!(reason("SELECT * FROM main.expenses"), GuardReason::UnknownTable);
        assert_eq!(reason("SELECT * FROM expenses, sqlite_master"), GuardReason::UnknownTable);
        assert_eq!(
            reason("SELECT * FROM expenses WHERE EXISTS (SELECT 1 FROM sqlite_temp_master)"),
            GuardReason::UnknownTable
        );
        assert_eq!(reason("SELECT m.total FROM monthly m"), GuardReason::UnknownTable);
    }

    #[test]
    fn test_accepts_derived_tables_and_cte_lists() {
        let sql = "SELECT t.total FROM (SELECT SUM(amount) AS total FROM expenses) AS t";
        assert!(guard().validate(sql).is_ok());

        let sql = "WITH paid AS (SELECT loan_id, SUM(amount_paid) AS so_far FROM loan_payments GROUP BY loan_id), \
                   open_loans AS (SELECT id, total_amount FROM loans_master WHERE status = 'active') \
                   SELECT o.id, o.total_amount - COALESCE(p.so_far, 0) AS remaining \
                   FROM open_loans o LEFT JOIN paid p ON p.loan_id = o.id";
        assert!(guard().validate(sql).is_ok());

        let sql = "SELECT amount FROM expenses WHERE category IN (SELECT category FROM expenses GROUP BY category)";
        assert!(guard().validate(sql).is_ok());
    }

    #[test]
    fn test_rejects_unbalanced_parentheses() {
        assert_eq!(reason("SELECT SUM(amount)) FROM expenses"), GuardReason::Lexical);
        assert_eq!(reason("SELECT SUM((amount) FROM expenses"), GuardReason::Lexical);
    }

    #[test]
    fn test_rejects_unresolved_template_tokens() {
        assert_eq!(
            reason("SELECT * FROM expenses WHERE SUBSTR(date, 1, 4) = {{CURRENT_YEAR}}"),
            GuardReason::Lexical
        );
    }

    fn scramble(text: &str, mask: &[bool]) -> String {
        text.chars()
            .zip(mask.iter().cycle())
            .map(|(c, upper)| if *upper { c.to_ascii_uppercase() } else { c.to_ascii_lowercase() })
            .collect()
    }

    proptest! {
        #[test]
        fn prop_mutations_rejected_under_case_and_whitespace(
            mask in proptest::collection::vec(any::<bool>(), 1..16),
            pad in "[ \t\n]{1,4}",
            which in 0usize..5,
        ) {
            let statements = [
                "INSERT INTO expenses VALUES (1)",
                "UPDATE expenses SET amount = 1",
                "DELETE FROM expenses",
                "DROP TABLE expenses",
                "ATTACH 'x.db' AS x",
            ];
            let sql = scramble(statements[which], &mask).replace(' ', &pad);
            let err = guard().validate(&format!("{}{}{}", pad, sql, pad)).unwrap_err();
            prop_assert_eq!(err.reason, GuardReason::NotReadOnly);

            let chained = format!("SELECT amount FROM expenses;{}{}", pad, sql);
            let err = guard().validate(&chained).unwrap_err();
            prop_assert_eq!(err.reason, GuardReason::MultipleStatements);
        }

        #[test]
        fn prop_allow_listed_selects_accepted(
            table in 0usize..7,
            mask in proptest::collection::vec(any::<bool>(), 1..8),
        ) {
            let schema = SchemaDescriptor::personal_records();
            let t = &schema.tables()[table];
            let columns = t.column_names().join(", ");
            let sql = format!("{} {} {} {}", scramble("select", &mask), columns, scramble("from", &mask), t.name);
            prop_assert!(guard().validate(&sql).is_ok(), "{}", sql);
        }
    }
}
