use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use snafu::{OptionExt, ResultExt, Snafu};
use tracing_subscriber::EnvFilter;

use homelink_messaging::{
    AppendOutcome, Composer, ConversationDirectory, DeliveryState, DirectoryUpdate, Entry,
    MessageStore, MessagingError, MessagingSettings, ReadTracker, SettingsStore, SharedSettings,
};
use homelink_storage::{
    ConversationRecord, ConversationStore, MessageLog, NewConversation, ParticipantId,
    SqliteStorage, StorageError,
};

const UPDATE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
struct RunnerArgs {
    scenario: Scenario,
    db_path: Option<String>,
    config_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy)]
enum Scenario {
    SettingsLoad,
    ReplayDedup,
    OfflineRetry,
    ReadMidcall,
    SingleChannel,
    All,
}

impl Scenario {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "settings_load" => Some(Self::SettingsLoad),
            "replay_dedup" => Some(Self::ReplayDedup),
            "offline_retry" => Some(Self::OfflineRetry),
            "read_midcall" => Some(Self::ReadMidcall),
            "single_channel" => Some(Self::SingleChannel),
            "all" => Some(Self::All),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::SettingsLoad => "settings_load",
            Self::ReplayDedup => "replay_dedup",
            Self::OfflineRetry => "offline_retry",
            Self::ReadMidcall => "read_midcall",
            Self::SingleChannel => "single_channel",
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
    #[snafu(display("missing required --db argument for scenario '{scenario}'"))]
    MissingDbPath {
        stage: &'static str,
        scenario: &'static str,
    },
    #[snafu(display("storage call failed: {source}"))]
    StorageValidation {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("messaging call failed: {source}"))]
    MessagingValidation {
        stage: &'static str,
        source: MessagingError,
    },
    #[snafu(display("timed out waiting for a directory update at {stage}"))]
    UpdateTimeout { stage: &'static str },
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

    let settings = load_settings(args.config_path.as_deref());
    match args.scenario {
        Scenario::SettingsLoad => run_settings_load(&settings),
        Scenario::ReplayDedup => {
            let db_path = require_db_path(&args, "replay_dedup")?;
            run_replay_dedup(&with_database(&settings, db_path)).await
        }
        Scenario::OfflineRetry => {
            let db_path = require_db_path(&args, "offline_retry")?;
            run_offline_retry(&with_database(&settings, db_path)).await
        }
        Scenario::ReadMidcall => {
            let db_path = require_db_path(&args, "read_midcall")?;
            run_read_midcall(&with_database(&settings, db_path)).await
        }
        Scenario::SingleChannel => {
            let db_path = require_db_path(&args, "single_channel")?;
            run_single_channel(&with_database(&settings, db_path)).await
        }
        Scenario::All => run_all(&settings, args.db_path.as_deref()).await,
    }
}

fn load_settings(config_path: Option<&Path>) -> MessagingSettings {
    match config_path {
        Some(path) => {
            println!("config_path={}", path.display());
            SettingsStore::new(path.to_path_buf()).settings().as_ref().clone()
        }
        None => MessagingSettings::from_figment(&MessagingSettings::figment(None))
            .unwrap_or_default(),
    }
}

/// Points the loaded settings at the scenario database given on the command line.
fn with_database(settings: &MessagingSettings, db_path: &str) -> MessagingSettings {
    MessagingSettings {
        database_path: Some(PathBuf::from(db_path)),
        ..settings.clone()
    }
}

fn parse_args(args: impl IntoIterator<Item = String>) -> RunnerResult<RunnerArgs> {
    let mut scenario = None;
    let mut db_path = None;
    let mut config_path = None;
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
            "--config" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-config-value",
                    arg: "--config",
                })?;
                config_path = Some(PathBuf::from(value));
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
        config_path,
    })
}

async fn run_all(settings: &MessagingSettings, db_path: Option<&str>) -> RunnerResult<()> {
    run_settings_load(settings)?;

    if let Some(path) = db_path {
        let settings = with_database(settings, path);
        run_replay_dedup(&settings).await?;
        run_offline_retry(&settings).await?;
        run_read_midcall(&settings).await?;
        run_single_channel(&settings).await?;
    }

    println!("all_passed=true");
    Ok(())
}

fn run_settings_load(settings: &MessagingSettings) -> RunnerResult<()> {
    let backoff = settings.backoff();
    println!("backoff_initial_ms={}", settings.backoff_initial_ms);
    println!("backoff_ceiling_ms={}", settings.backoff_ceiling_ms);
    println!(
        "unavailable_after_attempts={}",
        settings.unavailable_after_attempts
    );
    println!("feed_capacity={}", settings.feed_capacity);
    println!("database_path={}", settings.database_location().display());

    let ceiling = Duration::from_millis(settings.backoff_ceiling_ms);
    let delays_bounded = (1..=32).all(|failures| backoff.delay(failures) <= ceiling);
    println!("delays_bounded={delays_bounded}");
    if !delays_bounded || settings.unavailable_after_attempts == 0 {
        return fail(
            "scenario-settings-load-assert",
            "settings_load",
            "normalized settings must bound the reconnect delay".to_string(),
        );
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_replay_dedup(settings: &MessagingSettings) -> RunnerResult<()> {
    reset_sqlite_files(settings)?;
    let storage = open_storage(settings, "scenario-replay-dedup-open").await?;
    let conversation = seed_conversation(&storage, "scenario-replay-dedup-seed").await?;
    let viewer_id = conversation.homeowner_id;

    for body in ["A", "B"] {
        storage
            .insert_message(conversation.id, conversation.provider_id, body.to_string())
            .await
            .context(StorageValidationSnafu {
                stage: "scenario-replay-dedup-insert-history",
            })?;
    }

    let mut directory =
        ConversationDirectory::new(viewer_id, storage.clone(), SharedSettings::new(settings.clone()));
    directory.load().await.context(MessagingValidationSnafu {
        stage: "scenario-replay-dedup-load",
    })?;
    directory
        .select_active(conversation.id)
        .await
        .context(MessagingValidationSnafu {
            stage: "scenario-replay-dedup-select",
        })?;
    wait_for(&mut directory, "scenario-replay-dedup-caught-up", |update| {
        matches!(update, DirectoryUpdate::CaughtUp { .. })
    })
    .await?;

    let live = storage
        .insert_message(conversation.id, conversation.provider_id, "D".to_string())
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-replay-dedup-insert-live",
        })?;
    wait_for(&mut directory, "scenario-replay-dedup-live", |update| {
        matches!(update, DirectoryUpdate::MessageApplied { message_id, .. } if *message_id == live.id)
    })
    .await?;

    // Replay the whole history the way a reconnect gap-fill from the start would.
    let replay = storage
        .query_messages(conversation.id, None)
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-replay-dedup-replay",
        })?;
    let mut shadow = MessageStore::new(conversation.id, viewer_id);
    let mut duplicates = 0;
    for record in replay.iter().cloned().chain(replay.iter().cloned()) {
        if shadow.append(record) == AppendOutcome::DuplicateIgnored {
            duplicates += 1;
        }
    }

    let bodies = snapshot_bodies(&directory);
    let shadow_bodies: Vec<String> = shadow
        .entries()
        .iter()
        .map(|entry| entry.body().to_string())
        .collect();
    println!("snapshot={}", bodies.join(","));
    println!("replay_duplicates_ignored={duplicates}");

    if bodies != ["A", "B", "D"] || shadow_bodies != bodies || duplicates != 3 {
        return fail(
            "scenario-replay-dedup-assert",
            "replay_dedup",
            "re-delivered messages must not duplicate or reorder entries".to_string(),
        );
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_offline_retry(settings: &MessagingSettings) -> RunnerResult<()> {
    reset_sqlite_files(settings)?;
    let online = open_storage(settings, "scenario-offline-retry-open").await?;
    let offline = open_storage(settings, "scenario-offline-retry-open-offline").await?;
    offline.pool().close().await;
    let conversation = seed_conversation(&online, "scenario-offline-retry-seed").await?;

    let mut store = MessageStore::new(conversation.id, conversation.homeowner_id);
    let mut offline_composer = Composer::new(offline.clone());
    let online_composer = Composer::new(online.clone());

    let outgoing = offline_composer
        .begin_send(&mut store, "hello")
        .context(MessagingValidationSnafu {
            stage: "scenario-offline-retry-begin",
        })?;
    let tentative_id = outgoing.tentative_id;
    let pending_shown = matches!(
        store.entries(),
        [Entry::Tentative(message)] if message.state == DeliveryState::Pending
    );

    let report = offline_composer.dispatch(outgoing).await;
    let send_failed = matches!(
        offline_composer.reconcile(&mut store, report),
        Err(MessagingError::SendFailure { .. })
    );
    let failed_shown = store
        .tentative(tentative_id)
        .is_some_and(|message| message.is_failed());

    let retry = online_composer
        .retry(&mut store, tentative_id)
        .context(MessagingValidationSnafu {
            stage: "scenario-offline-retry-retry",
        })?;
    let report = online_composer.dispatch(retry).await;
    let resolution = online_composer
        .reconcile(&mut store, report)
        .context(MessagingValidationSnafu {
            stage: "scenario-offline-retry-reconcile",
        })?;
    let confirmed = matches!(
        store.entries(),
        [Entry::Confirmed(record)] if record.id == resolution.message_id
    );

    println!("pending_shown={pending_shown}");
    println!("send_failed={send_failed}");
    println!("failed_shown={failed_shown}");
    println!("confirmed_after_retry={confirmed}");

    if !(pending_shown && send_failed && failed_shown && confirmed) {
        return fail(
            "scenario-offline-retry-assert",
            "offline_retry",
            "offline send must show pending, then failed, then one confirmed entry".to_string(),
        );
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_read_midcall(settings: &MessagingSettings) -> RunnerResult<()> {
    reset_sqlite_files(settings)?;
    let storage = open_storage(settings, "scenario-read-midcall-open").await?;
    let conversation = seed_conversation(&storage, "scenario-read-midcall-seed").await?;
    let reader = conversation.homeowner_id;

    for body in ["quote attached", "available friday"] {
        storage
            .insert_message(conversation.id, conversation.provider_id, body.to_string())
            .await
            .context(StorageValidationSnafu {
                stage: "scenario-read-midcall-insert",
            })?;
    }

    let mut store = MessageStore::new(conversation.id, reader);
    store
        .hydrate(
            storage
                .query_messages(conversation.id, None)
                .await
                .context(StorageValidationSnafu {
                    stage: "scenario-read-midcall-hydrate",
                })?,
        )
        .context(MessagingValidationSnafu {
            stage: "scenario-read-midcall-hydrate",
        })?;
    let unread_before = ReadTracker::compute_unread_count(&store);

    let mut tracker = ReadTracker::new(storage.clone());
    let batch = tracker
        .begin_mark(&mut store)
        .context(ScenarioFailedSnafu {
            stage: "scenario-read-midcall-begin",
            scenario: "read_midcall",
            reason: "expected unread messages to mark".to_string(),
        })?;
    let late = storage
        .insert_message(conversation.id, conversation.provider_id, "one more".to_string())
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-read-midcall-insert-late",
        })?;
    store.append(late);
    let report = tracker.persist(batch).await;
    let flipped = tracker.complete(report).context(MessagingValidationSnafu {
        stage: "scenario-read-midcall-persist",
    })?;
    let unread_after = ReadTracker::compute_unread_count(&store);

    println!("unread_before={unread_before}");
    println!("flipped={flipped}");
    println!("unread_after={unread_after}");

    if unread_before != 2 || flipped != 2 || unread_after != 1 {
        return fail(
            "scenario-read-midcall-assert",
            "read_midcall",
            "messages arriving during a mark must stay unread".to_string(),
        );
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_single_channel(settings: &MessagingSettings) -> RunnerResult<()> {
    reset_sqlite_files(settings)?;
    let storage = open_storage(settings, "scenario-single-channel-open").await?;
    let first = seed_conversation(&storage, "scenario-single-channel-seed").await?;
    let second = storage
        .create_conversation(NewConversation {
            homeowner_id: first.homeowner_id,
            provider_id: ParticipantId::new_v7(),
            project_ref: None,
        })
        .await
        .context(StorageValidationSnafu {
            stage: "scenario-single-channel-seed-second",
        })?;

    let mut directory = ConversationDirectory::new(
        first.homeowner_id,
        storage.clone(),
        SharedSettings::new(settings.clone()),
    );
    directory.load().await.context(MessagingValidationSnafu {
        stage: "scenario-single-channel-load",
    })?;

    for conversation_id in [first.id, second.id, first.id, second.id] {
        directory
            .select_active(conversation_id)
            .await
            .context(MessagingValidationSnafu {
                stage: "scenario-single-channel-select",
            })?;
        wait_for(&mut directory, "scenario-single-channel-caught-up", |update| {
            matches!(update, DirectoryUpdate::CaughtUp { conversation_id: caught_up, .. } if *caught_up == conversation_id)
        })
        .await?;
    }

    let mut subscribers = storage.feed().subscriber_count();
    for _ in 0..100 {
        if subscribers <= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        subscribers = storage.feed().subscriber_count();
    }
    println!("feed_subscribers={subscribers}");

    if subscribers != 2 || directory.active_conversation() != Some(second.id) {
        return fail(
            "scenario-single-channel-assert",
            "single_channel",
            format!("expected change feed plus one channel, found {subscribers} subscribers"),
        );
    }

    println!("runner_ok=true");
    Ok(())
}

async fn open_storage(
    settings: &MessagingSettings,
    stage: &'static str,
) -> RunnerResult<Arc<SqliteStorage>> {
    settings
        .open_storage()
        .await
        .map(Arc::new)
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

async fn wait_for<F>(
    directory: &mut ConversationDirectory,
    stage: &'static str,
    mut accept: F,
) -> RunnerResult<DirectoryUpdate>
where
    F: FnMut(&DirectoryUpdate) -> bool,
{
    let waited = tokio::time::timeout(UPDATE_TIMEOUT, async {
        while let Some(update) = directory.next_update().await {
            if accept(&update) {
                return Some(update);
            }
        }
        None
    })
    .await;

    match waited {
        Ok(Some(update)) => Ok(update),
        Ok(None) | Err(_) => UpdateTimeoutSnafu { stage }.fail(),
    }
}

fn snapshot_bodies(directory: &ConversationDirectory) -> Vec<String> {
    directory
        .active_snapshot()
        .unwrap_or_default()
        .iter()
        .map(|entry| entry.body().to_string())
        .collect()
}

fn fail(stage: &'static str, scenario: &'static str, reason: String) -> RunnerResult<()> {
    ScenarioFailedSnafu {
        stage,
        scenario,
        reason,
    }
    .fail()
}

fn reset_sqlite_files(settings: &MessagingSettings) -> RunnerResult<()> {
    let location = settings.database_location();
    let db_path = location.to_string_lossy();
    if db_path == ":memory:" {
        return Ok(());
    }
    remove_file_if_exists(&location, "scenario-reset-sqlite-db")?;
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

fn require_db_path<'a>(args: &'a RunnerArgs, scenario: &'static str) -> RunnerResult<&'a str> {
    args.db_path.as_deref().context(MissingDbPathSnafu {
        stage: "require-db-path",
        scenario,
    })
}
