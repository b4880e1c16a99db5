mod recorder;

use clap::builder::TypedValueParser;
use clap::Parser;
use log::{error, info};
use recorder::stats::compute_stats;
use recorder::stream::HttpSource;
use recorder::{
    CaptureResult, LogObserver, Outcome, Recorder, RecordingRequest, RetryPolicy,
    DEFAULT_CHUNK_SIZE,
};
use tokio::runtime;
use tokio_util::sync::CancellationToken;
use url::Url;

use std::path::PathBuf;
use std::process;
use std::time::Duration;

const DEFAULT_STREAM_URL: &str = "http://northumberland.serverroom.net:8850/";

/// Record a live internet radio stream to a file for a fixed duration.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// HTTP or HTTPS stream to record
    #[arg(long, env = "BASSREC_URL", default_value = DEFAULT_STREAM_URL, value_parser = parse_stream_url)]
    url: Url,

    /// Recording length in seconds
    #[arg(long, env = "BASSREC_DURATION", default_value_t = 5400,
          value_parser = clap::value_parser!(u64).range(1..))]
    duration: u64,

    /// Output file [default: bass_station_<YYYY-MM-DD>.mp3]
    #[arg(short, long, env = "BASSREC_OUTPUT")]
    output: Option<PathBuf>,

    /// Largest chunk read from the stream at once, in bytes
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE,
          value_parser = clap::value_parser!(u64).range(1..).map(|n| n as usize))]
    chunk_size: usize,

    /// Seconds without data before the connection counts as dropped
    #[arg(long, default_value_t = 30, value_parser = clap::value_parser!(u64).range(1..))]
    read_timeout: u64,

    /// Seconds allowed for establishing the connection
    #[arg(long, default_value_t = 10)]
    connect_timeout: u64,

    /// Consecutive stream failures that end the recording
    #[arg(long, default_value_t = 3)]
    retries: u32,

    /// Initial reconnect delay in milliseconds, doubled on each attempt
    #[arg(long, default_value_t = 1000)]
    backoff_ms: u64,
}

fn parse_stream_url(s: &str) -> Result<Url, String> {
    let url = Url::parse(s).map_err(|e| format!("invalid URL: {}", e))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(format!("unsupported scheme '{}', expected http or https", other)),
    }
}

fn default_output_path() -> PathBuf {
    let today = chrono::Local::now().format("%Y-%m-%d");
    PathBuf::from(format!("bass_station_{}.mp3", today))
}

/**
 * Cancels `token` on Ctrl-C (and SIGTERM on unix) so the recording loop can
 * close the file cleanly instead of being killed mid-write.
 */
async fn cancel_on_signal(token: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("Interrupted, finishing recording...");
    token.cancel();
}

fn report(result: &CaptureResult, target: Duration) {
    match result.outcome {
        Outcome::Success | Outcome::PartialSuccess => {
            if result.outcome == Outcome::PartialSuccess {
                println!("Recording stopped early, partial audio kept.");
                if let Some(detail) = result.error_detail() {
                    println!("Reason: {}", detail);
                }
            }
            let stats = compute_stats(result.bytes_written, target.as_secs());
            println!("Audio saved to {}", result.path.display());
            println!("Bytes written: {}", result.bytes_written);
            println!("File size: {:.2} MB", stats.size_mb);
            match stats.bitrate_kbps {
                Some(kbps) => println!("Approximate bitrate: {:.2} kbps", kbps),
                None => println!("Approximate bitrate: n/a"),
            }
        }
        Outcome::Failure => {
            let (class, detail) = match &result.error {
                Some(e) => (e.class(), e.to_string()),
                None => ("Unknown", String::from("no detail")),
            };
            eprintln!("Recording failed [{}]: {}", class, detail);
            if result.bytes_written > 0 {
                eprintln!(
                    "{} bytes were kept in {}",
                    result.bytes_written,
                    result.path.display()
                );
            }
        }
    }
}

fn main() {
    env_logger::init();

    let args = Args::parse();

    let request = RecordingRequest {
        stream_url: args.url,
        duration: Duration::from_secs(args.duration),
        output_path: args.output.unwrap_or_else(default_output_path),
    };

    let source = match HttpSource::new(
        Duration::from_secs(args.connect_timeout),
        Duration::from_secs(args.read_timeout),
        args.chunk_size,
    ) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("Failed to set up HTTP client: {}", e);
            process::exit(1);
        }
    };

    let rt = match runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create a runtime: {}", e);
            process::exit(1);
        }
    };

    let cancel = CancellationToken::new();
    let retry = RetryPolicy::new(args.retries, Duration::from_millis(args.backoff_ms));
    let recorder = Recorder::new(source, retry, cancel.clone());

    let result = rt.block_on(async {
        tokio::spawn(cancel_on_signal(cancel));
        recorder.capture(&request, &mut LogObserver::default()).await
    });

    report(&result, request.duration);

    process::exit(match result.outcome {
        Outcome::Success => 0,
        Outcome::PartialSuccess => 2,
        Outcome::Failure => 1,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_http_and_https_only() {
        assert!(parse_stream_url("http://example.com:8850/").is_ok());
        assert!(parse_stream_url("https://example.com/live.mp3").is_ok());
        assert!(parse_stream_url("ftp://example.com/live.mp3").is_err());
        assert!(parse_stream_url("not a url").is_err());
    }

    #[test]
    fn default_output_is_dated_mp3() {
        let name = default_output_path().to_string_lossy().into_owned();
        assert!(name.starts_with("bass_station_"));
        assert!(name.ends_with(".mp3"));
        // bass_station_YYYY-MM-DD.mp3
        assert_eq!(name.len(), "bass_station_".len() + 10 + 4);
    }

    #[test]
    fn cli_defaults() {
        let args = Args::try_parse_from(["bassrec"]).unwrap();
        assert_eq!(args.url.as_str(), DEFAULT_STREAM_URL);
        assert_eq!(args.duration, 5400);
        assert_eq!(args.chunk_size, 8192);
        assert_eq!(args.retries, 3);
        assert!(args.output.is_none());
    }

    #[test]
    fn zero_duration_is_rejected() {
        assert!(Args::try_parse_from(["bassrec", "--duration", "0"]).is_err());
    }

    #[test]
    fn zero_read_timeout_is_rejected() {
        assert!(Args::try_parse_from(["bassrec", "--read-timeout", "0"]).is_err());
        let args = Args::try_parse_from(["bassrec", "--read-timeout", "5"]).unwrap();
        assert_eq!(args.read_timeout, 5);
    }

    #[test]
    fn chunk_size_parses_to_usize() {
        let args = Args::try_parse_from(["bassrec", "--chunk-size", "4096"]).unwrap();
        assert_eq!(args.chunk_size, 4096);
        assert!(Args::try_parse_from(["bassrec", "--chunk-size", "0"]).is_err());
    }
}
