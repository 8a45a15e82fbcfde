use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;

use rfrender::{
    ChallengeDisposition, Credential, EngineConfig, HttpEngine, NoopActivity, PostAction,
    RenderOptions, RenderQueue, RenderTask,
};

/// Render a page and print what it extracts to.
#[derive(Parser, Debug)]
#[command(name = "rfrender", version, about = "Render a page headlessly and print its HTML")]
struct Args {
    /// URL to render
    url: String,

    /// Cancel the render after this many seconds
    #[arg(long, default_value_t = 30.0)]
    timeout: f64,

    /// Wait this many seconds after load before extracting
    #[arg(long, conflicts_with = "validate")]
    wait: Option<f64>,

    /// Extract once this script expression evaluates to `true`
    #[arg(long)]
    validate: Option<String>,

    /// Allow the page to end loading early through the `doneLoading` channel
    #[arg(long)]
    skip_media: bool,

    /// Do not log activity indicator changes
    #[arg(long)]
    quiet_activity: bool,

    /// User for HTTP authentication challenges
    #[arg(long, requires = "password")]
    user: Option<String>,

    #[arg(long, requires = "user")]
    password: Option<String>,

    #[arg(long)]
    user_agent: Option<String>,

    /// Print the outcome as JSON instead of the raw payload
    #[arg(long)]
    json: bool,
}

fn seconds(value: f64, flag: &str) -> Result<Duration> {
    Duration::try_from_secs_f64(value).with_context(|| format!("invalid --{} value {}", flag, value))
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut config = EngineConfig::default();
    if let Some(ua) = &args.user_agent {
        config.user_agent = ua.clone();
    }
    let engine = Arc::new(HttpEngine::new(config)?);

    let options = RenderOptions {
        timeout: seconds(args.timeout, "timeout")?,
        load_media_content: !args.skip_media,
        show_activity: true,
    };
    let post_action = match (&args.wait, &args.validate) {
        (Some(wait), _) => PostAction::Wait(seconds(*wait, "wait")?),
        (None, Some(condition)) => PostAction::Validate(condition.clone()),
        (None, None) => PostAction::None,
    };

    let mut task = RenderTask::new(args.url.clone(), &engine, options)
        .with_navigation(args.url.clone())
        .with_post_action(post_action);
    if args.quiet_activity {
        task = task.with_activity_indicator(Arc::new(NoopActivity));
    }
    if let (Some(user), Some(password)) = (args.user.clone(), args.password.clone()) {
        task = task.with_auth_handler(move |challenge| {
            if challenge.previous_failure_count > 0 {
                return ChallengeDisposition::CancelAuthenticationChallenge;
            }
            ChallengeDisposition::UseCredential(Credential::new(user.clone(), password.clone()))
        });
    }

    let queue = RenderQueue::new()?;
    let outcome = queue.render_blocking(task)?;
    queue.shutdown()?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&outcome.to_json())?);
        return Ok(());
    }
    if let Some(err) = &outcome.error {
        bail!("render failed: {}", err);
    }
    if outcome.cancelled {
        bail!("render cancelled ({:?})", outcome.cancel_cause);
    }
    match outcome.text() {
        Some(text) => println!("{}", text),
        None => bail!("page produced no extractable content"),
    }
    Ok(())
}
