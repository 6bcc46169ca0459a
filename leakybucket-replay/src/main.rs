//! Leaky bucket replay - pours normalized events through one scenario's bucket and
//! prints each overflow as a JSON line.

#![deny(missing_docs)]

use conf::Conf;
use leakybucket::{
    BucketConfig, BucketFactory, BucketWorker, Event, LoggingConfig, PourError, init_logging,
    overflow_channel,
};
use std::{env, fs, path::PathBuf};
use tokio::io::{AsyncBufRead, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod json_lines;
use json_lines::JsonLinesReader;

/// Top-level configuration for leakybucket-replay.
#[derive(Conf, Debug)]
#[conf(serde, test)]
pub struct Config {
    /// Path to a TOML config file (optional).
    /// This is parsed before other args, so config file values can be overridden by CLI args.
    #[allow(dead_code)] // Parsed early via find_parameter, kept here for --help
    #[conf(long)]
    config_file: Option<PathBuf>,
    /// If true, just validate config and don't start
    #[conf(long)]
    dry_run: bool,
    /// File of events, as JSON Lines. Events are read from stdin if unset.
    #[conf(long, env)]
    events_file: Option<PathBuf>,
    /// Number of events buffered ahead of the bucket
    #[conf(long, env, default_value = "1024")]
    input_queue_size: usize,
    /// Number of overflows buffered before the bucket waits for them to be written
    #[conf(long, env, default_value = "16")]
    overflow_queue_size: usize,
    #[conf(flatten, prefix)]
    bucket: BucketConfig,
    #[conf(flatten, serde(flatten))]
    logging: LoggingConfig,
}

fn load_config() -> Result<Config, Box<dyn std::error::Error>> {
    // Check for --config-file before the main parse, so we can load it and pass to conf
    let config_file_path = conf::find_parameter("config-file", env::args_os());

    let Some(config_path) = config_file_path else {
        return Ok(Config::parse());
    };
    let path_display = config_path.to_string_lossy();
    let file_contents = fs::read_to_string(&config_path)
        .map_err(|err| format!("Could not open config file '{path_display}': {err}"))?;
    let doc: toml::Value = toml::from_str(&file_contents)
        .map_err(|err| format!("Config file '{path_display}' is not valid TOML: {err}"))?;
    Ok(Config::conf_builder().doc(path_display, doc).parse())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // .env has to be loaded before the config is parsed, but is only reported once
    // logging is up
    let dotenv_result = dotenvy::dotenv();
    let config = load_config()?;
    init_logging(&config.logging)?;

    match dotenv_result {
        Ok(path) => info!("Read dotenv file from: {}", path.display()),
        Err(dotenvy::Error::Io(io_error))
            if matches!(io_error.kind(), std::io::ErrorKind::NotFound) =>
        {
            info!("Couldn't find a dotenv file");
        }
        Err(err) => return Err(format!("Error reading dotenv file: {err}").into()),
    }

    info!("Config = {config:#?}");

    if config.dry_run {
        return Ok(());
    }

    let (overflow_tx, mut overflow_rx) = overflow_channel(config.overflow_queue_size.max(1));
    let bucket = BucketFactory::new(config.bucket.clone()).make_bucket(overflow_tx);
    let worker = BucketWorker::spawn(bucket, config.input_queue_size.max(1));

    // Overflows go to stdout, one JSON document per line
    let writer_task = tokio::task::spawn(async move {
        let mut stdout = tokio::io::stdout();
        let mut written = 0u64;
        while let Some(overflow) = overflow_rx.recv().await {
            let mut line = serde_json::to_vec(&overflow)?;
            line.push(b'\n');
            stdout.write_all(&line).await?;
            stdout.flush().await?;
            written += 1;
        }
        Ok::<u64, std::io::Error>(written)
    });

    let input: Box<dyn AsyncBufRead + Unpin + Send> = match &config.events_file {
        Some(path) => {
            let file = tokio::fs::File::open(path).await.map_err(|err| {
                format!("Could not open events file '{}': {err}", path.display())
            })?;
            info!("Reading events from {}", path.display());
            Box::new(BufReader::new(file))
        }
        None => {
            info!("Reading events from stdin");
            Box::new(BufReader::new(tokio::io::stdin()))
        }
    };

    // Listen for ctrl-c. The first one stops reading and lets the worker finish the pour
    // in progress, a second one exits without waiting for the drain.
    let stop_token = worker.stop_token();
    let thread_token = stop_token.clone();
    tokio::task::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("ctrl-c: Stop requested");
        thread_token.cancel();
        if tokio::signal::ctrl_c().await.is_ok() {
            error!("ctrl-c: Exiting without draining the bucket");
            std::process::exit(130);
        }
    });

    let read_result = feed_until_stopped(JsonLinesReader::new(input), &worker, &stop_token).await;

    // The bucket owns the overflow sender, so the writer ends once the worker does
    let finish_result = worker.finish().await;
    let written = writer_task.await??;
    let stats = finish_result?;
    read_result?;

    info!(
        "Replay done: {} overflows written, stats = {}",
        written,
        serde_json::to_string(&stats)?
    );
    Ok(())
}

/// Feed the worker until EOF, or until `stop_token` is cancelled.
async fn feed_until_stopped<R>(
    reader: JsonLinesReader<R>,
    worker: &BucketWorker,
    stop_token: &CancellationToken,
) -> Result<(), std::io::Error>
where
    R: AsyncBufRead + Unpin,
{
    tokio::select! {
        result = feed_worker(reader, worker) => result,
        _ = stop_token.cancelled() => {
            info!("Stopped reading events");
            Ok(())
        }
    }
}

/// Read events until EOF and hand them to the worker.
///
/// Lines that are not valid events are logged and skipped.
async fn feed_worker<R>(
    mut reader: JsonLinesReader<R>,
    worker: &BucketWorker,
) -> Result<(), std::io::Error>
where
    R: AsyncBufRead + Unpin,
{
    let mut skipped = 0usize;
    while let Some(value) = reader.next_value().await? {
        let event: Event = match serde_json::from_slice(&value) {
            Ok(event) => event,
            Err(err) => {
                error!("line {}: not a valid event: {err}", reader.line_no());
                skipped += 1;
                continue;
            }
        };
        if let Err(PourError::WorkerGone) = worker.pour(event).await {
            // The reason is reported by finish()
            warn!("Bucket worker stopped, no more events will be read");
            break;
        }
    }
    if skipped > 0 {
        warn!("Skipped {skipped} invalid events");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use conf::Conf;
    use leakybucket::{
        BucketMode, BucketState, LeakRate, LogMode, OutOfOrderPolicy, Overflow, OverflowPolicy,
    };
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn worker_for(capacity: u32) -> (BucketWorker, mpsc::Receiver<Overflow>) {
        let (tx, rx) = overflow_channel(16);
        let config = BucketConfig::new("crowdsecurity/ssh-bf", capacity, LeakRate::ZERO)
            .mode(BucketMode::TimeMachine);
        let worker = BucketWorker::spawn(BucketFactory::new(config).make_bucket(tx), 16);
        (worker, rx)
    }

    #[tokio::test]
    async fn test_feed_reads_to_eof() {
        let input = br#"{"line": {"raw": "a"}, "time": "2024-01-01T00:00:00Z"}
not json
{"line": {"raw": "b"}, "time": "2024-01-01T00:00:01Z"}
{
  "line": {"raw": "c"},
  "time": "2024-01-01T00:00:02Z"
}
"#;
        let (worker, mut rx) = worker_for(2);
        let stop_token = worker.stop_token();
        let reader = JsonLinesReader::new(BufReader::new(&input[..]));

        feed_until_stopped(reader, &worker, &stop_token).await.unwrap();
        let stats = worker.finish().await.unwrap();

        assert_eq!(stats.total_count, 3);
        assert_eq!(stats.state, BucketState::Overflowed);
        let overflow = rx.recv().await.unwrap();
        assert_eq!(overflow.events.len(), 3);
    }

    #[tokio::test]
    async fn test_feed_stops_on_cancel_while_input_is_open() {
        let (worker, _rx) = worker_for(5);
        let stop_token = worker.stop_token();

        // The writing half stays open, so the reader would wait forever
        let (mut writer, reader) = tokio::io::duplex(1024);
        writer
            .write_all(b"{\"line\": {\"raw\": \"a\"}, \"time\": \"2024-01-01T00:00:00Z\"}\n")
            .await
            .unwrap();

        let thread_token = stop_token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            thread_token.cancel();
        });

        let reader = JsonLinesReader::new(BufReader::new(reader));
        tokio::time::timeout(
            Duration::from_secs(5),
            feed_until_stopped(reader, &worker, &stop_token),
        )
        .await
        .expect("feed should stop once cancelled")
        .unwrap();

        let stats = tokio::time::timeout(Duration::from_secs(5), worker.finish())
            .await
            .expect("worker should stop once cancelled")
            .unwrap();
        assert!(stats.total_count <= 1);
        drop(writer);
    }

    #[test]
    fn test_toml_config() {
        let toml_config = r#"
events_file = "/var/log/crowdsec/replay.jsonl"
input_queue_size = 64
log_mode = "file"
log_dir = "/var/log/leakybucket"
log_level = "leakybucket=debug"

[bucket]
name = "crowdsecurity/ssh-bf"
capacity = 5
leak_speed = "1 / 10s"
mode = "time-machine"
queue_size = 100
overflow_policy = "reset"
out_of_order = "reject"
"#;

        let doc: toml::Value = toml::from_str(toml_config).expect("Failed to parse TOML");
        let empty_env: [(&str, &str); 0] = [];
        let config: Config = Config::conf_builder()
            .args(["."])
            .env(empty_env)
            .doc("test.toml", doc)
            .try_parse()
            .expect("Failed to parse config");

        assert_eq!(
            config.events_file,
            Some(PathBuf::from("/var/log/crowdsec/replay.jsonl"))
        );
        assert_eq!(config.input_queue_size, 64);
        assert_eq!(config.overflow_queue_size, 16);
        assert!(!config.dry_run);

        assert_eq!(config.logging.log_mode, LogMode::File);
        assert_eq!(
            config.logging.log_file_path().unwrap(),
            Some(PathBuf::from("/var/log/leakybucket/leakybucket.log"))
        );
        assert_eq!(config.logging.log_level, "leakybucket=debug");

        let bucket = &config.bucket;
        assert_eq!(bucket.name, "crowdsecurity/ssh-bf");
        assert_eq!(bucket.capacity, 5);
        assert_eq!(bucket.leak_speed, LeakRate::every(Duration::from_secs(10)));
        assert_eq!(bucket.mode, BucketMode::TimeMachine);
        assert_eq!(bucket.queue_size, Some(100));
        assert_eq!(bucket.overflow_policy, OverflowPolicy::Reset);
        assert_eq!(bucket.out_of_order, OutOfOrderPolicy::Reject);
    }

    #[test]
    fn test_args_config() {
        let empty_env: [(&str, &str); 0] = [];
        let config: Config = Config::conf_builder()
            .args([
                ".",
                "--dry-run",
                "--bucket-name",
                "crowdsecurity/http-crawl",
                "--bucket-capacity",
                "40",
                "--log-mode",
                "stdout",
            ])
            .env(empty_env)
            .try_parse()
            .expect("Failed to parse config");

        assert!(config.dry_run);
        assert_eq!(config.events_file, None);
        assert_eq!(config.bucket.name, "crowdsecurity/http-crawl");
        assert_eq!(config.bucket.capacity, 40);
        assert_eq!(config.bucket.mode, BucketMode::Live);
        assert_eq!(config.logging.log_mode, LogMode::Stdout);
    }
}
