use siteforge::config::Config;
use siteforge::error::{ActionResponse, ErrorCode};
use siteforge::orchestrator::{Action, Orchestrator, Payload};
use siteforge::sitelog;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::NonBlocking;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

const USAGE: &str = "\
Usage: siteforge <action> [payload-json]

Actions:
  create      Build and run a site        {\"name\", \"template\"|\"stack\", \"sourceType\", \"repoUrl\", \"archivePath\", \"port\"}
  start       Start a site's container    {\"name\"}
  stop        Stop a site's container     {\"name\"}
  delete      Remove a site entirely      {\"name\"}
  status      Inspect a site's container  {\"name\"}
  logs        Tail a site's container     {\"name\", \"lines\"}
  deploy-log  Show a site's deployment log {\"name\"}
  list        List all sites
  stats       Count sites by status

Prints one JSON result line and exits 0 on success, 1 on failure.";

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if matches!(args.first().map(String::as_str), Some("-h" | "--help" | "help")) {
        println!("{}", USAGE);
        return;
    }

    let request = parse_args(&args);
    let config = Config::from_env();

    // Mutating actions also log to the site's own file
    let site_log = match (&request, &config) {
        (Ok((action, payload)), Ok(config)) if action.is_mutating() => payload
            .site_slug()
            .map(|slug| sitelog::writer(&config.paths.data_dir, slug.as_str())),
        _ => None,
    };
    let (writer, guard, log_error) = match site_log {
        Some(Ok((writer, guard))) => (Some(writer), Some(guard), None),
        Some(Err(e)) => (None, None, Some(e)),
        None => (None, None, None),
    };
    init_tracing(writer);
    if let Some(e) = log_error {
        warn!(error = %e, "Could not open site log");
    }

    let response = run(request, config).await;
    println!("{}", response.to_json());

    // Flush the site log before exiting
    drop(guard);
    std::process::exit(if response.success { 0 } else { 1 });
}

fn init_tracing(site_log: Option<NonBlocking>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("siteforge=info"));
    let site_layer = site_log.map(|writer| fmt::layer().with_ansi(false).with_writer(writer));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(site_layer)
        .init();
}

fn parse_args(args: &[String]) -> Result<(Action, Payload), ActionResponse> {
    let Some(action) = args.first() else {
        eprintln!("{}", USAGE);
        return Err(ActionResponse::error(
            ErrorCode::InvalidPayload,
            "Invalid request: missing action",
        ));
    };

    let action: Action = action.parse().map_err(|e| ActionResponse::failure(&e))?;
    let payload =
        Payload::parse(args.get(1).map(String::as_str)).map_err(|e| ActionResponse::failure(&e))?;
    Ok((action, payload))
}

async fn run(
    request: Result<(Action, Payload), ActionResponse>,
    config: anyhow::Result<Config>,
) -> ActionResponse {
    let (action, payload) = match request {
        Ok(request) => request,
        Err(response) => return response,
    };
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!(error = %format!("{:#}", e), "Failed to load configuration");
            return ActionResponse::error(ErrorCode::InternalError, ErrorCode::InternalError.summary());
        }
    };

    info!(
        action = %action,
        strict = config.execution.is_strict(),
        runtime = %config.runtime.binary,
        "Configuration loaded"
    );
    Orchestrator::from_config(config).dispatch(action, payload).await
}
