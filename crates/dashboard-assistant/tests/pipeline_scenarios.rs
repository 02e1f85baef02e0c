use chrono::{NaiveDate, NaiveDateTime};
use dashboard_assistant::synthesizer::NO_DATA_ANSWER;
use dashboard_assistant::{
    AssistantSession, ErrorKind, ExecutionLimits, GuardReason, Outcome, QueryExecutor, SchemaDescriptor,
    ScriptedEngine, SessionConfig, TurnOutcome,
};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

const FOOD_LAST_MONTH: &str = "What is the total I spent on Food last month?";

fn reference() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2025, 3, 15)
        .unwrap()
        .and_hms_opt(12, 0, 0)
        .unwrap()
}

fn food_total_sql(month: &str) -> String {
    format!(
        "SELECT SUM(amount) AS total_amount FROM expenses WHERE category = 'Food' AND SUBSTR(date, 1, 7) = '{}'",
        month
    )
}

fn create_database(dir: &TempDir, rows: &[(&str, &str, f64)]) -> PathBuf {
    let path = dir.path().join("dashboard.db");
    let conn = Connection::open(&path).unwrap();
    conn.execute_batch(
        "CREATE TABLE expenses (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            date TEXT NOT NULL,
            category TEXT NOT NULL,
            description TEXT,
            amount REAL NOT NULL
        );",
    )
    .unwrap();
    for (date, category, amount) in rows {
        conn.execute(
            "INSERT INTO expenses (date, category, description, amount) VALUES (?1, ?2, '', ?3)",
            rusqlite::params![date, category, amount],
        )
        .unwrap();
    }
    path
}

fn expense_count(path: &Path) -> i64 {
    let conn = Connection::open(path).unwrap();
    conn.query_row("SELECT COUNT(*) FROM expenses", [], |row| row.get(0)).unwrap()
}

fn start_session(db: &Path, engine: Arc<ScriptedEngine>) -> AssistantSession {
    let executor = QueryExecutor::open(db, ExecutionLimits::default()).unwrap();
    AssistantSession::new(
        Arc::new(SchemaDescriptor::personal_records()),
        engine,
        Arc::new(executor),
        SessionConfig::default(),
    )
}

#[tokio::test]
async fn test_no_matching_rows_is_no_data() {
    let dir = TempDir::new().unwrap();
    let db = create_database(&dir, &[("2025-01-10", "Food", 30.0), ("2025-02-11", "Transport", 15.0)]);
    let engine = Arc::new(ScriptedEngine::new([food_total_sql("2025-02")]));
    let mut session = start_session(&db, engine);

    let answer = session.ask_at(FOOD_LAST_MONTH, reference()).await;

    assert_eq!(answer.outcome, Outcome::NoData);
    assert_eq!(answer.text, NO_DATA_ANSWER);
    assert_eq!(session.history()[0].outcome, TurnOutcome::NoData);
}

#[tokio::test]
async fn test_food_total_for_last_month() {
    let dir = TempDir::new().unwrap();
    let db = create_database(
        &dir,
        &[
            ("2025-02-04", "Food", 50.0),
            ("2025-02-22", "Food", 75.0),
            ("2025-02-23", "Bills", 300.0),
            ("2025-03-02", "Food", 9.0),
        ],
    );
    let engine = Arc::new(ScriptedEngine::new([food_total_sql("2025-02")]));
    let mut session = start_session(&db, engine.clone());

    let answer = session.ask_at(FOOD_LAST_MONTH, reference()).await;

    assert_eq!(answer.outcome, Outcome::Success);
    assert!(answer.text.contains("125"), "answer was: {}", answer.text);
    assert_eq!(answer.sql.as_deref(), Some(food_total_sql("2025-02").as_str()));

    // The model only ever saw the absolute month.
    let prompt = &engine.prompts()[0];
    assert!(prompt.contains("Question: What is the total I spent on Food month 2025-02?\nSQL:"));
    assert!(!prompt.contains("last month?"));
}

#[tokio::test]
async fn test_follow_up_reuses_previous_filter() {
    let dir = TempDir::new().unwrap();
    let db = create_database(
        &dir,
        &[
            ("2025-02-04", "Food", 50.0),
            ("2025-02-22", "Food", 75.0),
            ("2025-03-02", "Food", 9.0),
            ("2025-03-05", "Transport", 40.0),
        ],
    );
    let engine = Arc::new(ScriptedEngine::new([food_total_sql("2025-02"), food_total_sql("2025-03")]));
    let mut session = start_session(&db, engine.clone());

    session.ask_at(FOOD_LAST_MONTH, reference()).await;
    let answer = session.ask_at("what about this month?", reference()).await;

    let follow_up_prompt = &engine.prompts()[1];
    let example = format!(
        "Question: What is the total I spent on Food month 2025-02?\nSQL: {}\n\n",
        food_total_sql("2025-02")
    );
    assert!(follow_up_prompt.contains(&example));
    assert!(follow_up_prompt.ends_with("Question: what about month 2025-03?\nSQL:"));

    assert_eq!(answer.outcome, Outcome::Success);
    assert!(answer.text.contains("$9.00"), "answer was: {}", answer.text);
    assert_eq!(session.history().len(), 2);
}

#[tokio::test]
async fn test_drop_table_is_rejected_before_execution() {
    let dir = TempDir::new().unwrap();
    let db = create_database(&dir, &[("2025-02-04", "Food", 50.0), ("2025-02-22", "Food", 75.0)]);
    let engine = Arc::new(ScriptedEngine::new(["DROP TABLE expenses;"]));
    let mut session = start_session(&db, engine);

    let answer = session.ask_at("Please clean up my expenses", reference()).await;

    assert_eq!(answer.outcome, Outcome::Error(ErrorKind::Guard(GuardReason::NotReadOnly)));
    assert!(answer.text.starts_with("I couldn't safely translate that into a query"));
    assert!(answer.sql.is_none());
    assert_eq!(expense_count(&db), 2);
}

#[tokio::test]
async fn test_obfuscated_writes_never_reach_the_store() {
    let dir = TempDir::new().unwrap();
    let db = create_database(&dir, &[("2025-02-04", "Food", 50.0)]);
    let attempts = [
        "dElEtE\tFROM expenses",
        "SELECT amount FROM expenses; DELETE FROM expenses",
        "  insert into expenses (date, category, amount) values ('2025-01-01', 'x', 1)",
        "WITH t AS (SELECT 1) UPDATE expenses SET amount = 0",
        "ATTACH DATABASE '/tmp/x.db' AS x",
        "SELECT * FROM sqlite_master",
    ];
    let engine = Arc::new(ScriptedEngine::new(attempts));
    let mut session = start_session(&db, engine);

    for _ in attempts {
        let answer = session.ask_at("do something", reference()).await;
        assert!(
            matches!(answer.outcome, Outcome::Error(ErrorKind::Guard(_))),
            "unexpected outcome {:?}",
            answer.outcome
        );
    }
    assert_eq!(expense_count(&db), 1);
}

#[tokio::test]
async fn test_aliased_reads_of_unlisted_tables_are_rejected() {
    let dir = TempDir::new().unwrap();
    let db = create_database(&dir, &[("2025-02-04", "Food", 50.0)]);
    Connection::open(&db)
        .unwrap()
        .execute_batch("CREATE TABLE settings (k TEXT, v TEXT); INSERT INTO settings VALUES ('pin', '4242');")
        .unwrap();
    let attempts = [
        "SELECT sql AS sql FROM sqlite_master AS sqlite_master",
        "SELECT v AS v FROM settings AS settings",
        "SELECT \"randomblob\"(8) AS \"randomblob\" FROM expenses",
    ];
    let engine = Arc::new(ScriptedEngine::new(attempts));
    let mut session = start_session(&db, engine);

    let expected = [
        GuardReason::UnknownTable,
        GuardReason::UnknownTable,
        GuardReason::DisallowedFunction,
    ];
    for reason in expected {
        let answer = session.ask_at("show me everything", reference()).await;
        assert_eq!(answer.outcome, Outcome::Error(ErrorKind::Guard(reason)));
        assert!(!answer.text.contains("4242"));
        assert!(answer.sql.is_none());
    }
}

#[tokio::test]
async fn test_documents_expiring_next_month_across_year_end() {
    let dir = TempDir::new().unwrap();
    let db = create_database(&dir, &[]);
    Connection::open(&db)
        .unwrap()
        .execute_batch(
            "CREATE TABLE documents (id INTEGER PRIMARY KEY, name TEXT, expiry_date TEXT);
             INSERT INTO documents (name, expiry_date) VALUES
                ('Passport', '2026-01-20'),
                ('Residence permit', '2026-12-01');",
        )
        .unwrap();
    let engine = Arc::new(ScriptedEngine::new([
        "SELECT name, expiry_date FROM documents WHERE SUBSTR(expiry_date, 1, 7) = '{{CURRENT_YEAR}}-{{CURRENT_MONTH+1}}'",
    ]));
    let mut session = start_session(&db, engine);
    let december = NaiveDate::from_ymd_opt(2025, 12, 15)
        .unwrap()
        .and_hms_opt(8, 0, 0)
        .unwrap();

    let answer = session.ask_at("Which documents expire next month?", december).await;

    assert_eq!(answer.outcome, Outcome::Success);
    assert!(answer.text.contains("Passport"), "{}", answer.text);
    assert!(!answer.text.contains("Residence permit"));
    assert!(answer.sql.unwrap().contains("'2026-01'"));
}

#[tokio::test]
async fn test_small_talk_is_answered_without_a_query() {
    let dir = TempDir::new().unwrap();
    let db = create_database(&dir, &[("2025-02-04", "Food", 50.0)]);
    let engine = Arc::new(ScriptedEngine::new(["REPLY: You're welcome!"]));
    let mut session = start_session(&db, engine);

    let answer = session.ask_at("Thanks!", reference()).await;

    assert_eq!(answer.outcome, Outcome::Reply);
    assert_eq!(answer.text, "You're welcome!");
    assert!(answer.sql.is_none());
    assert!(session.history().is_empty());
}
