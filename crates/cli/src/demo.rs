//! A small application wired with hooks on every stage, used by the CLI

use anyhow::Result;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info};

use hookline_core::lifecycle::{ValidationIssue, handler, validator};
use hookline_core::{
    Application, Config, Hook, HttpError, Payload, RouteOptions, ScopeOptions, Stage,
};

const ADMIN_TOKEN: &str = "Bearer demo";

/// Counter shared through a root decorator
pub struct Hits(AtomicU64);

pub async fn build(config: Config) -> Result<Application> {
    let mut app = Application::new(config);
    let root = app.root();

    app.decorate(root, "hits", Hits(AtomicU64::new(0)))?;

    app.add_hook(
        root,
        Stage::OnRequest,
        Hook::request(|ctx| {
            Box::pin(async move {
                let id = ctx.request.id.clone();
                ctx.reply_mut().set_header("x-request-id", id)?;
                Ok(None)
            })
        })
        .named("request-id"),
    )?;
    app.add_hook(
        root,
        Stage::OnSend,
        Hook::request(|ctx| {
            Box::pin(async move {
                ctx.reply_mut().set_header("x-powered-by", "hookline")?;
                Ok(None)
            })
        })
        .named("powered-by"),
    )?;
    app.add_hook(
        root,
        Stage::OnResponse,
        Hook::request_done(|ctx, done| {
            debug!(
                "{} {} answered {} in {:?}",
                ctx.request.method,
                ctx.request.url,
                ctx.reply().status(),
                ctx.elapsed()
            );
            done.ok();
        })
        .named("access-log"),
    )?;
    app.add_hook(
        root,
        Stage::OnError,
        Hook::request_done(|ctx, done| {
            if let Some(err) = ctx.error() {
                debug!("request failed: {}", err);
            }
            done.ok();
        })
        .named("error-log"),
    )?;
    app.add_hook(
        root,
        Stage::OnReady,
        Hook::app(|scope| async move {
            info!("'{}' ready", scope.name());
            Ok(())
        })
        .named("announce"),
    )?;
    app.add_hook(
        root,
        Stage::OnClose,
        Hook::app_done(|scope, done| {
            if let Some(hits) = scope.decorator::<Hits>("hits") {
                info!("served {} request(s)", hits.0.load(Ordering::Relaxed));
            }
            done.ok();
        })
        .named("report"),
    )?;

    // Every child scope counts its requests on the shared decorator
    app.add_hook(
        root,
        Stage::OnRegister,
        Hook::register(|tree, child| {
            Box::pin(async move {
                let hits = tree.decorator::<Hits>(child, "hits");
                tree.add_hook(
                    child,
                    Stage::OnRequest,
                    Hook::request_done(move |_ctx, done| {
                        if let Some(hits) = &hits {
                            hits.0.fetch_add(1, Ordering::Relaxed);
                        }
                        done.ok();
                    })
                    .named("count-hits"),
                )?;
                Ok(())
            })
        })
        .named("instrument"),
    )?;

    app.route(
        root,
        RouteOptions::get(
            "/",
            handler(|_ctx| Box::pin(async { Ok(Payload::from("hookline demo\n")) })),
        ),
    )?;

    let api = app
        .register_scope(root, ScopeOptions::named("api").with_prefix("/api"))
        .await?;
    app.add_hook(
        api,
        Stage::PreSerialization,
        Hook::request(|ctx| {
            Box::pin(async move {
                let data = ctx.payload().as_json().cloned().unwrap_or_default();
                Ok(Some(Payload::from(json!({ "data": data }))))
            })
        })
        .named("envelope"),
    )?;
    app.route(
        api,
        RouteOptions::get(
            "/items",
            handler(|_ctx| {
                Box::pin(async {
                    Ok(Payload::from(json!([
                        {"id": 1, "name": "anvil"},
                        {"id": 2, "name": "rope"}
                    ])))
                })
            }),
        ),
    )?;
    app.route(
        api,
        RouteOptions::post(
            "/items",
            handler(|ctx| {
                Box::pin(async move {
                    ctx.reply_mut().set_status(201)?;
                    Ok(Payload::from(json!({"id": 3, "name": ctx.request.body["name"]})))
                })
            }),
        )
        .with_validator(validator(|request| match request.body.get("name") {
            Some(name) if name.is_string() => Ok(()),
            Some(_) => Err(vec![ValidationIssue::new("body/name", "must be a string")]),
            None => Err(vec![ValidationIssue::new("body/name", "is required")]),
        })),
    )?;
    app.route(
        api,
        RouteOptions::get(
            "/slow",
            handler(|_ctx| {
                Box::pin(async {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    Ok(Payload::from(json!({"slow": true})))
                })
            }),
        ),
    )?;

    let admin = app
        .register_scope(root, ScopeOptions::named("admin").with_prefix("/admin"))
        .await?;
    app.add_hook(
        admin,
        Stage::PreHandler,
        Hook::request(|ctx| {
            Box::pin(async move {
                match ctx.request.header("authorization") {
                    Some(ADMIN_TOKEN) => Ok(None),
                    _ => Err(HttpError::unauthorized("admin token required").into()),
                }
            })
        })
        .named("auth"),
    )?;
    let routes = Arc::new(app.routes());
    app.route(
        admin,
        RouteOptions::get(
            "/routes",
            handler(move |_ctx| {
                let listed: Vec<_> = routes
                    .iter()
                    .map(|(method, path)| format!("{} {}", method, path))
                    .collect();
                Box::pin(async move { Ok(Payload::from(json!(listed))) })
            }),
        ),
    )?;

    Ok(app)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hookline_core::{InjectRequest, LifecycleState};

    async fn ready_app() -> Application {
        let mut app = build(Config::default()).await.unwrap();
        app.ready().await.unwrap();
        app
    }

    #[tokio::test]
    async fn test_demo_tree() {
        let app = build(Config::default()).await.unwrap();
        let tree = app.print_plugins();
        assert!(tree.starts_with("root"));
        assert!(tree.contains("├── api (prefix /api, onRequest: 1, preSerialization: 1)\n"));
        assert!(tree.contains("└── admin (prefix /admin, onRequest: 1, preHandler: 1)\n"));
    }

    #[tokio::test]
    async fn test_envelope_applies_to_api_only() {
        let app = ready_app().await;
        let items = app.inject(InjectRequest::get("/api/items")).await.unwrap();
        let response = items.response.unwrap();
        assert_eq!(response.json().unwrap()["data"][0]["name"], "anvil");
        assert_eq!(response.header("x-powered-by"), Some("hookline"));

        let index = app.inject(InjectRequest::get("/")).await.unwrap();
        assert_eq!(index.response.unwrap().text(), "hookline demo\n");
    }

    #[tokio::test]
    async fn test_admin_requires_token() {
        let app = ready_app().await;
        let denied = app.inject(InjectRequest::get("/admin/routes")).await.unwrap();
        assert_eq!(denied.response.unwrap().status, 401);

        let allowed = app
            .inject(InjectRequest::get("/admin/routes").header("authorization", ADMIN_TOKEN))
            .await
            .unwrap();
        let listed = allowed.response.unwrap().json().unwrap();
        assert!(listed.as_array().unwrap().iter().any(|r| r == "POST /api/items"));
    }

    #[tokio::test]
    async fn test_create_item_validates() {
        let app = ready_app().await;
        let created = app
            .inject(InjectRequest::post("/api/items").json(&json!({"name": "hook"})))
            .await
            .unwrap();
        let response = created.response.unwrap();
        assert_eq!(response.status, 201);
        assert_eq!(response.json().unwrap()["data"]["name"], "hook");

        let invalid = app
            .inject(InjectRequest::post("/api/items").json(&json!({"name": 7})))
            .await
            .unwrap();
        assert_eq!(invalid.response.unwrap().status, 400);
    }

    #[tokio::test]
    async fn test_slow_route_times_out() {
        let mut config = Config::default();
        config.server.connection_timeout_ms = 20;
        let mut app = build(config).await.unwrap();
        app.ready().await.unwrap();
        let report = app.inject(InjectRequest::get("/api/slow")).await.unwrap();
        assert_eq!(report.state, LifecycleState::TimedOut);
    }

    #[tokio::test]
    async fn test_hits_are_counted() {
        let mut app = ready_app().await;
        app.inject(InjectRequest::get("/api/items")).await.unwrap();
        app.inject(InjectRequest::get("/")).await.unwrap();
        let root = app.root();
        let hits = app.decorator::<Hits>(root, "hits").unwrap();
        assert_eq!(hits.0.load(Ordering::Relaxed), 1);
        app.close().await.unwrap();
    }
}
