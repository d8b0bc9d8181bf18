//! Command line entry point: issue one request and stream the response body
//! to stdout.
//!
//! ```text
//! pingcall [-c CONFIG] [-X METHOD] [-H 'name: value']... [-d DATA | -d @FILE] TARGET
//! ```

use std::{process::ExitCode, sync::Arc};

use clap::Parser;
use futures::StreamExt;
use http::{header::HeaderName, HeaderValue, Method};
use tokio::{io::AsyncWriteExt, sync::watch};

use pingcall::{
    config::Config,
    logging::Logger,
    telemetry::LogSink,
    BodySource, Client, RequestError, RequestOptions, RequestResult,
};

#[derive(Debug, Parser)]
#[command(name = "pingcall")]
#[command(about = "Issue one HTTP request and stream the response body to stdout")]
struct Args {
    /// YAML configuration file
    #[arg(short, long, env = "PINGCALL_CONFIG")]
    config: Option<String>,

    /// Request method; POST when data is given, GET otherwise
    #[arg(short = 'X', long = "request", value_parser = parse_method)]
    method: Option<Method>,

    /// Extra request header, `name: value`
    #[arg(short = 'H', long = "header", value_parser = parse_header)]
    headers: Vec<(HeaderName, HeaderValue)>,

    /// Request body, or `@path` to stream a file
    #[arg(short, long)]
    data: Option<String>,

    /// Absolute URL, or a path resolved against the configured base URL
    target: String,
}

fn parse_method(method: &str) -> Result<Method, String> {
    Method::from_bytes(method.as_bytes()).map_err(|_| format!("invalid method {method}"))
}

fn parse_header(header: &str) -> Result<(HeaderName, HeaderValue), String> {
    let (name, value) = header
        .split_once(':')
        .ok_or_else(|| format!("malformed header {header}, expected `name: value`"))?;
    let name = HeaderName::from_bytes(name.trim().as_bytes())
        .map_err(|e| format!("header {name}: {e}"))?;
    let value = HeaderValue::from_str(value.trim()).map_err(|e| format!("header {name}: {e}"))?;
    Ok((name, value))
}

fn body_from(data: Option<String>) -> BodySource {
    match data {
        Some(data) => match data.strip_prefix('@') {
            Some(path) => BodySource::from_file(path),
            None => BodySource::from(data),
        },
        None => BodySource::None,
    }
}

async fn run(args: Args, config: &Config) -> RequestResult<()> {
    let client = Client::from_config(&config.client)?.with_telemetry(Arc::new(LogSink));
    let method = args.method.unwrap_or_else(|| {
        if args.data.is_some() {
            Method::POST
        } else {
            Method::GET
        }
    });
    let options = args
        .headers
        .into_iter()
        .fold(RequestOptions::new(), |options, (name, value)| {
            options.with_header(name, value)
        });

    let response = client
        .execute(method, &args.target, body_from(args.data), options)
        .await?;
    log::info!("{:?} {}", response.version, response.status);

    let mut stdout = tokio::io::stdout();
    let mut body = response.into_body();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(RequestError::Transport)?;
        stdout
            .write_all(&chunk)
            .await
            .map_err(|e| RequestError::Internal(format!("failed to write output: {e}")))?;
    }
    stdout
        .flush()
        .await
        .map_err(|e| RequestError::Internal(format!("failed to write output: {e}")))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => match Config::load_from_yaml(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Error loading configuration: {e}");
                return ExitCode::FAILURE;
            }
        },
        None => Config::default(),
    };

    // Logging goes to the configured file when there is one
    let (shutdown_tx, shutdown) = watch::channel(false);
    let log_task = match &config.log {
        Some(log_config) => {
            let logger = Logger::new(log_config.clone());
            if let Err(e) = logger.init_env_logger() {
                eprintln!("{e}");
                return ExitCode::FAILURE;
            }
            Some(tokio::spawn(logger.run(shutdown)))
        }
        None => {
            let _ = env_logger::try_init();
            None
        }
    };

    let result = run(args, &config).await;

    if let Some(task) = log_task {
        let _ = shutdown_tx.send(true);
        if let Ok(Err(e)) = task.await {
            eprintln!("{e}");
        }
    }

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}: {e}", e.code());
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Result<Args, clap::Error> {
        Args::try_parse_from(std::iter::once("pingcall").chain(argv.iter().copied()))
    }

    #[test]
    fn test_parse_args() {
        let args = parse(&[
            "-c",
            "pingcall.yaml",
            "-X",
            "PUT",
            "-H",
            "accept: application/json",
            "--header",
            "x-trace: 1",
            "-d",
            "@payload.bin",
            "http://127.0.0.1/upload",
        ])
        .unwrap();
        assert_eq!(args.config.as_deref(), Some("pingcall.yaml"));
        assert_eq!(args.method, Some(Method::PUT));
        assert_eq!(args.headers.len(), 2);
        assert_eq!(args.headers[0].1, "application/json");
        assert_eq!(args.target, "http://127.0.0.1/upload");
        assert_eq!(body_from(args.data).kind(), "stream");
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse(&[]).is_err());
        assert!(parse(&["-c"]).is_err());
        assert!(parse(&["--verbose", "http://x/"]).is_err());
        assert!(parse(&["-H", "no-colon", "http://x/"]).is_err());
        assert!(parse(&["-X", "BAD METHOD", "http://x/"]).is_err());
    }

    #[test]
    fn test_inline_body() {
        assert_eq!(body_from(Some("a=1".to_string())).kind(), "text");
        assert_eq!(body_from(None).kind(), "none");
    }

    #[test]
    fn test_command() {
        use clap::CommandFactory;
        Args::command().debug_assert();
    }
}
