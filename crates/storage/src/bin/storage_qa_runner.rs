use std::collections::HashSet;
use std::env;
use std::path::Path;
use std::str::FromStr;

use snafu::{OptionExt, ResultExt, Snafu};
use tracing_subscriber::EnvFilter;

use homelink_storage::{
    ConversationId, ConversationRecord, ConversationStore, LiveFeed, MessageId, MessageLog,
    NewConversation, ParticipantId, SqliteStorage, StorageError,
};

#[derive(Debug, Clone)]
struct RunnerArgs {
    scenario: Scenario,
    db_path: Option<String>,
}

#[derive(Debug, Clone, Copy)]
enum Scenario {
    IdRoundtrip,
    IdInvalid,
    SchemaInit,
    FkViolation,
    ConversationPair,
    MessageOrder,
    GapFill,
    ReadFlags,
    FeedDelivery,
    All,
}

impl Scenario {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "id_roundtrip" => Some(Self::IdRoundtrip),
            "id_invalid" => Some(Self::IdInvalid),
            "schema_init" => Some(Self::SchemaInit),
            "fk_violation" => Some(Self::FkViolation),
            "conversation_pair" => Some(Self::ConversationPair),
            "message_order" => Some(Self::MessageOrder),
            "gap_fill" => Some(Self::GapFill),
            "read_flags" => Some(Self::ReadFlags),
            "feed_delivery" => Some(Self::FeedDelivery),
            "all" => Some(Self::All),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::IdRoundtrip => "id_roundtrip",
            Self::IdInvalid => "id_invalid",
            Self::SchemaInit => "schema_init",
            Self::FkViolation => "fk_violation",
            Self::ConversationPair => "conversation_pair",
            Self::MessageOrder => "message_order",
            Self::GapFill => "gap_fill",
            Self::ReadFlags => "read_flags",
            Self::FeedDelivery => "feed_delivery",
            Self::All => "all",
        }
    }
}

#[derive(Debug, Snafu)]
enum RunnerError {
    #[snafu(display("missing required --scenario argument"))]
    MissingScenario { stage: &'static str },
    #[snafu(display("missing value for argument '{arg}'"))]
    MissingArgumentValue {
        stage: &'static str,
        arg: &'static str,
    },
    #[snafu(display("unknown scenario '{raw}'"))]
    UnknownScenario { stage: &'static str, raw: String },
    #[snafu(display("unknown argument '{raw}'"))]
    UnknownArgument { stage: &'static str, raw: String },
    #[snafu(display("storage validation failed: {source}"))]
    StorageValidation {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("missing required --db argument for scenario '{scenario}'"))]
    MissingDbPath {
        stage: &'static str,
        scenario: &'static str,
    },
    #[snafu(display("sqlite query failed: {source}"))]
    SqliteQuery {
        stage: &'static str,
        source: sqlx::Error,
    },
    #[snafu(display("scenario '{scenario}' failed: {reason}"))]
    ScenarioFailed {
        stage: &'static str,
        scenario: &'static str,
        reason: String,
    },
    #[snafu(display("file operation failed at '{path}': {source}"))]
    FileIo {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
}

type RunnerResult<T> = Result<T, RunnerError>;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(error) = run().await {
        println!("runner_ok=false");
        eprintln!("runner_error={error}");
        std::process::exit(1);
    }
}

async fn run() -> RunnerResult<()> {
    let args = parse_args(env::args().skip(1))?;
    println!("scenario={}", args.scenario.name());
    if let Some(db_path) = args.db_path.as_deref() {
        println!("db_path={db_path}");
    }

    match args.scenario {
        Scenario::IdRoundtrip => run_id_roundtrip(),
        Scenario::IdInvalid => run_id_invalid(),
        Scenario::SchemaInit => run_schema_init(require_db_path(&args, "schema_init")?).await,
        Scenario::FkViolation => run_fk_violation(require_db_path(&args, "fk_violation")?).await,
        Scenario::ConversationPair => {
            run_conversation_pair(require_db_path(&args, "conversation_pair")?).await
        }
        Scenario::MessageOrder => {
            run_message_order(require_db_path(&args, "message_order")?).await
        }
        Scenario::GapFill => run_gap_fill(require_db_path(&args, "gap_fill")?).await,
        Scenario::ReadFlags => run_read_flags(require_db_path(&args, "read_flags")?).await,
        Scenario::FeedDelivery => {
            run_feed_delivery(require_db_path(&args, "feed_delivery")?).await
        }
        Scenario::All => run_all(args.db_path.as_deref()).await,
    }
}

fn parse_args(args: impl IntoIterator<Item = String>) -> RunnerResult<RunnerArgs> {
    let mut scenario = None;
    let mut db_path = None;
    let mut pending = args.into_iter();

    while let Some(argument) = pending.next() {
        match argument.as_str() {
            "--scenario" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-scenario-value",
                    arg: "--scenario",
                })?;

                let parsed = Scenario::parse(&value).context(UnknownScenarioSnafu {
                    stage: "parse-args-scenario",
                    raw: value,
                })?;
                scenario = Some(parsed);
            }
            "--db" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-db-value",
                    arg: "--db",
                })?;
                db_path = Some(value);
            }
            _ => {
                return UnknownArgumentSnafu {
                    stage: "parse-args",
                    raw: argument,
                }
                .fail();
            }
        }
    }

    Ok(RunnerArgs {
        scenario: scenario.context(MissingScenarioSnafu {
            stage: "parse-args-scenario-required",
        })?,
        db_path,
    })
}

fn run_id_roundtrip() -> RunnerResult<()> {
    assert_id_roundtrip("participant_id", ParticipantId::new_v7())?;
    assert_id_roundtrip("conversation_id", ConversationId::new_v7())?;
    assert_id_roundtrip("message_id", MessageId::new_v7())?;
    println!("id_roundtrip=true");
    println!("runner_ok=true");
    Ok(())
}

fn run_id_invalid() -> RunnerResult<()> {
    let invalid_input = "not-a-valid-uuid";
    let invalid_id_error = invalid_input_is_rejected::<ParticipantId>(invalid_input)
        && invalid_input_is_rejected::<ConversationId>(invalid_input)
        && invalid_input_is_rejected::<MessageId>(invalid_input);

    println!("invalid_id_error={invalid_id_error}");
    if !invalid_id_error {
        return ScenarioFailedSnafu {
            stage: "scenario-id-invalid",
            scenario: "id_invalid",
            reason: "at least one ID wrapper accepted malformed UUID input".to_string(),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_all(db_path: Option<&str>) -> RunnerResult<()> {
    run_id_roundtrip()?;
    run_id_invalid()?;

    if let Some(path) = db_path {
        run_schema_init(path).await?;
        run_fk_violation(path).await?;
        run_conversation_pair(path).await?;
        run_message_order(path).await?;
        run_gap_fill(path).await?;
        run_read_flags(path).await?;
        run_feed_delivery(path).await?;
    }

    println!("all_passed=true");
    Ok(())
}

async fn run_schema_init(db_path: &str) -> RunnerResult<()> {
    reset_sqlite_files(db_path)?;
    let storage = open_storage(db_path, "scenario-schema-init-open").await?;
    let pool = storage.pool();

    let discovered_tables = sqlx::query_scalar::<_, String>(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name IN ('conversations', 'messages')",
    )
    .fetch_all(pool)
    .await
    .context(SqliteQuerySnafu {
        stage: "scenario-schema-init-list-tables",
    })?;

    let available_tables: HashSet<String> = discovered_tables.into_iter().collect();
    let schema_ok = ["conversations", "messages"]
        .iter()
        .all(|table_name| available_tables.contains(*table_name));

    let journal_mode = sqlx::query_scalar::<_, String>("PRAGMA journal_mode;")
        .fetch_one(pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "scenario-schema-init-journal-mode",
        })?
        .to_lowercase();
    let foreign_keys = sqlx::query_scalar::<_, i64>("PRAGMA foreign_keys;")
        .fetch_one(pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "scenario-schema-init-foreign-keys",
        })?;

    println!("schema_ok={schema_ok}");
    println!("journal_mode={journal_mode}");
    println!("foreign_keys={foreign_keys}");

    if !schema_ok {
        return fail(
            "scenario-schema-init-assert-schema",
            "schema_init",
            "expected migration tables are missing".to_string(),
        );
    }

    if journal_mode != "wal" {
        return fail(
            "scenario-schema-init-assert-journal-mode",
            "schema_init",
            format!("expected journal_mode=wal but was {journal_mode}"),
        );
    }

    if foreign_keys != 1 {
        return fail(
            "scenario-schema-init-assert-foreign-keys",
            "schema_init",
            format!("expected foreign_keys=1 but was {foreign_keys}"),
        );
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_fk_violation(db_path: &str) -> RunnerResult<()> {
    let storage = open_storage(db_path, "scenario-fk-violation-open").await?;

    let insert_result = sqlx::query(
        "INSERT INTO messages (id, conversation_id, sender_id, body, created_at, is_read) VALUES (?, ?, ?, ?, ?, 0)",
    )
    .bind(MessageId::new_v7().to_string())
    .bind(ConversationId::new_v7().to_string())
    .bind(ParticipantId::new_v7().to_string())
    .bind("orphan-row")
    .bind(0_i64)
    .execute(storage.pool())
    .await;

    let fk_violation_blocked = match insert_result {
        Ok(_) => false,
        Err(error) if is_foreign_key_violation(&error) => true,
        Err(error) => {
            return fail(
                "scenario-fk-violation-insert",
                "fk_violation",
                format!("unexpected sqlite error while testing FK guard: {error}"),
            );
        }
    };

    println!("fk_violation_blocked={fk_violation_blocked}");
    if !fk_violation_blocked {
        return fail(
            "scenario-fk-violation-assert",
            "fk_violation",
            "orphan message row was accepted".to_string(),
        );
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_conversation_pair(db_path: &str) -> RunnerResult<()> {
    let storage = open_storage(db_path, "scenario-conversation-pair-open").await?;
    let first = seed_conversation(&storage, "scenario-conversation-pair-create").await?;

    let repeated = storage
        .create_conversation(NewConversation {
            homeowner_id: first.homeowner_id,
            provider_id: first.provider_id,
            project_ref: None,
        })
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-conversation-pair-repeat",
        })?;

    let same_participant = storage
        .create_conversation(NewConversation {
            homeowner_id: first.homeowner_id,
            provider_id: first.homeowner_id,
            project_ref: None,
        })
        .await;

    let pair_unique = repeated.id == first.id;
    let self_pair_rejected = matches!(same_participant, Err(StorageError::Conflict { .. }));
    println!("pair_unique={pair_unique}");
    println!("self_pair_rejected={self_pair_rejected}");

    if !pair_unique || !self_pair_rejected {
        return fail(
            "scenario-conversation-pair-assert",
            "conversation_pair",
            "conversation pair constraints were not enforced".to_string(),
        );
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_message_order(db_path: &str) -> RunnerResult<()> {
    let storage = open_storage(db_path, "scenario-message-order-open").await?;
    let conversation = seed_conversation(&storage, "scenario-message-order-seed").await?;

    for index in 0..20 {
        let sender = if index % 2 == 0 {
            conversation.homeowner_id
        } else {
            conversation.provider_id
        };
        storage
            .insert_message(conversation.id, sender, format!("message-{index}"))
            .await
            .context(StorageValidationSnafu {
                stage: "scenario-message-order-insert",
            })?;
    }

    let messages = storage
        .query_messages(conversation.id, None)
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-message-order-query",
        })?;

    let ordered = messages
        .windows(2)
        .all(|pair| pair[0].order_key() < pair[1].order_key());
    let bodies_in_send_order = messages
        .iter()
        .enumerate()
        .all(|(index, message)| message.body == format!("message-{index}"));

    println!("message_count={}", messages.len());
    println!("ordered={ordered}");
    println!("bodies_in_send_order={bodies_in_send_order}");

    if messages.len() != 20 || !ordered || !bodies_in_send_order {
        return fail(
            "scenario-message-order-assert",
            "message_order",
            "messages were not returned in (created_at, id) order".to_string(),
        );
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_gap_fill(db_path: &str) -> RunnerResult<()> {
    let storage = open_storage(db_path, "scenario-gap-fill-open").await?;
    let conversation = seed_conversation(&storage, "scenario-gap-fill-seed").await?;

    let mut inserted = Vec::new();
    for index in 0..5 {
        let message = storage
            .insert_message(conversation.id, conversation.provider_id, format!("gap-{index}"))
            .await
            .context(StorageValidationSnafu {
                stage: "scenario-gap-fill-insert",
            })?;
        inserted.push(message);
    }

    let mark = inserted[1].order_key();
    let tail = storage
        .query_messages(conversation.id, Some(mark))
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-gap-fill-query",
        })?;
    let expected: Vec<MessageId> = inserted[2..].iter().map(|message| message.id).collect();
    let received: Vec<MessageId> = tail.iter().map(|message| message.id).collect();

    let strict_tail = received == expected;
    println!("gap_fill_count={}", received.len());
    println!("strict_tail={strict_tail}");

    if !strict_tail {
        return fail(
            "scenario-gap-fill-assert",
            "gap_fill",
            format!("expected {} messages after mark, got {}", expected.len(), received.len()),
        );
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_read_flags(db_path: &str) -> RunnerResult<()> {
    let storage = open_storage(db_path, "scenario-read-flags-open").await?;
    let conversation = seed_conversation(&storage, "scenario-read-flags-seed").await?;
    let reader = conversation.homeowner_id;

    let own = storage
        .insert_message(conversation.id, reader, "own".to_string())
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-read-flags-insert-own",
        })?;
    let inbound = storage
        .insert_message(conversation.id, conversation.provider_id, "inbound".to_string())
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-read-flags-insert-inbound",
        })?;

    let first_pass = storage
        .update_read_flags(conversation.id, reader, vec![own.id, inbound.id])
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-read-flags-first-pass",
        })?;
    let second_pass = storage
        .update_read_flags(conversation.id, reader, vec![own.id, inbound.id])
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-read-flags-second-pass",
        })?;
    let digest = storage
        .conversation_digest(conversation.id, reader)
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-read-flags-digest",
        })?;

    println!("first_pass_flipped={first_pass}");
    println!("second_pass_flipped={second_pass}");
    println!("unread_after={}", digest.unread_count);

    if first_pass != 1 || second_pass != 0 || digest.unread_count != 0 {
        return fail(
            "scenario-read-flags-assert",
            "read_flags",
            "read flags must flip once and only for inbound messages".to_string(),
        );
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_feed_delivery(db_path: &str) -> RunnerResult<()> {
    let storage = open_storage(db_path, "scenario-feed-delivery-open").await?;
    let conversation = seed_conversation(&storage, "scenario-feed-delivery-seed").await?;

    let mut scoped = storage
        .subscribe(conversation.id)
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-feed-delivery-subscribe",
        })?;
    let mut change_feed = storage
        .subscribe_all()
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-feed-delivery-subscribe-all",
        })?;

    let inserted = storage
        .insert_message(conversation.id, conversation.provider_id, "live".to_string())
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-feed-delivery-insert",
        })?;

    let scoped_delivery = matches!(scoped.try_recv(), Some(Ok(ref record)) if record.id == inserted.id);
    let change_feed_delivery =
        matches!(change_feed.try_recv(), Some(Ok(ref record)) if record.id == inserted.id);

    println!("scoped_delivery={scoped_delivery}");
    println!("change_feed_delivery={change_feed_delivery}");

    if !scoped_delivery || !change_feed_delivery {
        return fail(
            "scenario-feed-delivery-assert",
            "feed_delivery",
            "inserted message was not published to subscribers".to_string(),
        );
    }

    println!("runner_ok=true");
    Ok(())
}

async fn open_storage(db_path: &str, stage: &'static str) -> RunnerResult<SqliteStorage> {
    SqliteStorage::open(db_path)
        .await
        .context(StorageValidationSnafu { stage })
}

async fn seed_conversation(
    storage: &SqliteStorage,
    stage: &'static str,
) -> RunnerResult<ConversationRecord> {
    storage
        .create_conversation(NewConversation {
            homeowner_id: ParticipantId::new_v7(),
            provider_id: ParticipantId::new_v7(),
            project_ref: Some("qa-project".to_string()),
        })
        .await
        .context(StorageValidationSnafu { stage })
}

fn fail(stage: &'static str, scenario: &'static str, reason: String) -> RunnerResult<()> {
    ScenarioFailedSnafu {
        stage,
        scenario,
        reason,
    }
    .fail()
}

fn reset_sqlite_files(db_path: &str) -> RunnerResult<()> {
    remove_file_if_exists(Path::new(db_path), "scenario-reset-sqlite-db")?;
    let wal_path = format!("{db_path}-wal");
    remove_file_if_exists(Path::new(&wal_path), "scenario-reset-sqlite-wal")?;
    let shm_path = format!("{db_path}-shm");
    remove_file_if_exists(Path::new(&shm_path), "scenario-reset-sqlite-shm")?;
    Ok(())
}

fn remove_file_if_exists(path: &Path, stage: &'static str) -> RunnerResult<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(source) if source.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(RunnerError::FileIo {
            stage,
            path: path.display().to_string(),
            source,
        }),
    }
}

fn assert_id_roundtrip<T>(label: &'static str, id: T) -> RunnerResult<()>
where
    T: Copy + Eq + FromStr<Err = StorageError> + std::fmt::Display,
{
    let encoded = id.to_string();
    let decoded = encoded.parse::<T>().context(StorageValidationSnafu {
        stage: "scenario-id-roundtrip-parse",
    })?;

    if decoded != id {
        return fail(
            "scenario-id-roundtrip-compare",
            "id_roundtrip",
            format!("{label} parse/format roundtrip mismatch"),
        );
    }

    println!("{label}_roundtrip=true");
    Ok(())
}

fn invalid_input_is_rejected<T>(raw: &str) -> bool
where
    T: FromStr<Err = StorageError>,
{
    matches!(raw.parse::<T>(), Err(StorageError::InvalidId { .. }))
}

fn require_db_path<'a>(args: &'a RunnerArgs, scenario: &'static str) -> RunnerResult<&'a str> {
    args.db_path.as_deref().context(MissingDbPathSnafu {
        stage: "require-db-path",
        scenario,
    })
}

fn is_foreign_key_violation(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(database_error) => {
            if let Some(code) = database_error.code()
                && code == "787"
            {
                return true;
            }

            database_error
                .message()
                .contains("FOREIGN KEY constraint failed")
        }
        _ => false,
    }
}
