use anyhow::{Context, Result};
use clap::Args;
use serde_json::json;

use hookline_core::{Application, Config, InjectRequest};

#[derive(Args)]
pub struct InjectArgs {
    /// HTTP method
    pub method: String,

    /// Request URL, e.g. /api/items
    pub url: String,

    /// Request body
    #[arg(short, long)]
    pub body: Option<String>,

    /// Send the body as JSON (sets content-type)
    #[arg(long)]
    pub json: bool,

    /// Extra header as `name: value` (repeatable)
    #[arg(short = 'H', long = "header")]
    pub headers: Vec<String>,

    /// Output format: text (default) or json
    #[arg(short, long, default_value = "text")]
    pub format: String,
}

pub async fn run(args: InjectArgs, config: Config) -> Result<()> {
    let request = build_request(&args)?;
    let mut app = crate::demo::build(config).await?;
    app.ready().await?;
    exchange_and_close(&mut app, request, &args.format).await
}

fn build_request(args: &InjectArgs) -> Result<InjectRequest> {
    let mut request = InjectRequest::new(&args.method, &args.url);
    for header in &args.headers {
        let (name, value) = parse_header(header)?;
        request = request.header(name, value);
    }
    if let Some(body) = &args.body {
        if args.json {
            let value: serde_json::Value =
                serde_json::from_str(body).context("--body is not valid JSON")?;
            request = request.json(&value);
        } else {
            request = request.body(body.clone());
        }
    }
    Ok(request)
}

/// Inject one request and print the reply. `onClose` runs whether or not the
/// exchange succeeded.
async fn exchange_and_close(app: &mut Application, request: InjectRequest, format: &str) -> Result<()> {
    let outcome = exchange(app, request, format).await;
    let closed = app.close().await;
    outcome?;
    closed?;
    Ok(())
}

async fn exchange(app: &Application, request: InjectRequest, format: &str) -> Result<()> {
    let report = app.inject(request).await?;

    if format == "json" {
        let output = json!({
            "request_id": report.request_id,
            "state": report.state,
            "elapsed_ms": report.elapsed.as_millis() as u64,
            "fault": report.fault.as_ref().map(|f| f.to_string()),
            "response": report.response.as_ref().map(|r| json!({
                "status": r.status,
                "headers": r.headers,
                "body": r.text(),
            })),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        match &report.response {
            Some(response) => {
                println!(
                    "{} {}",
                    response.status,
                    hookline_core::error::reason_phrase(response.status)
                );
                for (name, value) in &response.headers {
                    println!("{}: {}", name, value);
                }
                println!();
                println!("{}", response.text());
            }
            None => println!("request {} timed out", report.request_id),
        }
        if let Some(fault) = &report.fault {
            eprintln!("Error: {}", fault);
        }
    }
    Ok(())
}

fn parse_header(raw: &str) -> Result<(&str, &str)> {
    let (name, value) = raw
        .split_once(':')
        .with_context(|| format!("Invalid header '{}', expected 'name: value'", raw))?;
    let name = name.trim();
    if name.is_empty() {
        anyhow::bail!("Invalid header '{}': empty name", raw);
    }
    Ok((name, value.trim()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_header() {
        assert_eq!(
            parse_header("Authorization: Bearer demo").unwrap(),
            ("Authorization", "Bearer demo")
        );
        assert_eq!(parse_header("x-a:1").unwrap(), ("x-a", "1"));
        assert!(parse_header("no-colon").is_err());
        assert!(parse_header(": value").is_err());
    }

    #[tokio::test]
    async fn test_close_runs_when_inject_fails() {
        use hookline_core::{Hook, Stage};
        use std::sync::Arc;
        use std::sync::atomic::{AtomicUsize, Ordering};

        let closed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&closed);
        let mut app = Application::default();
        let root = app.root();
        app.add_hook(
            root,
            Stage::OnClose,
            Hook::app_done(move |_scope, done| {
                counter.fetch_add(1, Ordering::SeqCst);
                done.ok();
            }),
        )
        .unwrap();

        // Never readied, so the inject itself fails
        let result = exchange_and_close(&mut app, InjectRequest::get("/"), "text").await;
        assert!(result.is_err());
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }
}
