//! Thin HTTP surface over the manager. Routing only; every handler is a
//! direct delegation plus a status mapping.

use crate::error::Error;
use crate::manager::{ExportPayload, Manager};
use crate::model::{Role, UserProfile};
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use warp::http::StatusCode;
use warp::reply::{Json, WithStatus};
use warp::Filter;

#[derive(Deserialize)]
struct StartRequest {
    user_id: String,
}

#[derive(Deserialize)]
struct MessageRequest {
    session_id: String,
    role: String,
    text: String,
}

#[derive(Deserialize)]
struct EndRequest {
    session_id: String,
}

#[derive(Deserialize)]
struct ContextRequest {
    session_id: String,
    #[serde(default)]
    query: Option<String>,
}

type Reply = Result<WithStatus<Json>, Infallible>;

fn ok(body: serde_json::Value) -> Reply {
    Ok(warp::reply::with_status(warp::reply::json(&body), StatusCode::OK))
}

fn fail(err: Error) -> Reply {
    let status = match &err {
        Error::UnknownSession(_) => StatusCode::NOT_FOUND,
        Error::Config(_) => StatusCode::BAD_REQUEST,
        Error::Storage(_) | Error::Cancelled => StatusCode::INTERNAL_SERVER_ERROR,
        Error::TransientLlm(_) | Error::Schema(_) => StatusCode::BAD_GATEWAY,
    };
    Ok(warp::reply::with_status(
        warp::reply::json(&json!({ "error": err.to_string() })),
        status,
    ))
}

fn with_manager(
    manager: Arc<Manager>,
) -> impl Filter<Extract = (Arc<Manager>,), Error = Infallible> + Clone {
    warp::any().map(move || manager.clone())
}

fn with_cancel(
    cancel: CancellationToken,
) -> impl Filter<Extract = (CancellationToken,), Error = Infallible> + Clone {
    warp::any().map(move || cancel.clone())
}

/// Build the full route tree.
pub fn routes(
    manager: Arc<Manager>,
    cancel: CancellationToken,
) -> impl Filter<Extract = (WithStatus<Json>,), Error = warp::Rejection> + Clone {
    let session_start = warp::path!("session" / "start")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_manager(manager.clone()))
        .and(with_cancel(cancel.clone()))
        .and_then(|req: StartRequest, mgr: Arc<Manager>, cancel: CancellationToken| async move {
            match mgr.start_session(&req.user_id, &cancel).await {
                Ok(session_id) => ok(json!({ "session_id": session_id })),
                Err(e) => fail(e),
            }
        });

    let session_message = warp::path!("session" / "message")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_manager(manager.clone()))
        .and(with_cancel(cancel.clone()))
        .and_then(|req: MessageRequest, mgr: Arc<Manager>, cancel: CancellationToken| async move {
            let Some(role) = Role::parse(&req.role) else {
                return fail(Error::Config(format!("unknown role '{}'", req.role)));
            };
            match mgr.add_message(&req.session_id, role, &req.text, &cancel).await {
                Ok(()) => ok(json!({})),
                Err(e) => fail(e),
            }
        });

    let session_end = warp::path!("session" / "end")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_manager(manager.clone()))
        .and(with_cancel(cancel.clone()))
        .and_then(|req: EndRequest, mgr: Arc<Manager>, cancel: CancellationToken| async move {
            match mgr.end_session(&req.session_id, &cancel).await {
                Ok(episode) => ok(json!({ "episode": episode })),
                Err(e) => fail(e),
            }
        });

    let context = warp::path!("context")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_manager(manager.clone()))
        .and(with_cancel(cancel.clone()))
        .and_then(|req: ContextRequest, mgr: Arc<Manager>, cancel: CancellationToken| async move {
            match mgr
                .get_memory_context(&req.session_id, req.query.as_deref(), &cancel)
                .await
            {
                Ok(ctx) => ok(json!({
                    "prompt": ctx.render(),
                    "profile": ctx.profile,
                    "facts": ctx.facts,
                    "episodes": ctx.episodes,
                })),
                Err(e) => fail(e),
            }
        });

    let profile_get = warp::path!("profile" / String)
        .and(warp::get())
        .and(with_manager(manager.clone()))
        .and_then(|user_id: String, mgr: Arc<Manager>| async move {
            match mgr.get_profile(&user_id).await {
                Ok(Some(profile)) => ok(json!(profile)),
                Ok(None) => Ok(warp::reply::with_status(
                    warp::reply::json(&json!({ "error": format!("no profile for {}", user_id) })),
                    StatusCode::NOT_FOUND,
                )),
                Err(e) => fail(e),
            }
        });

    let profile_put = warp::path!("profile")
        .and(warp::put())
        .and(warp::body::json())
        .and(with_manager(manager.clone()))
        .and_then(|profile: UserProfile, mgr: Arc<Manager>| async move {
            match mgr.put_profile(profile).await {
                Ok(()) => ok(json!({})),
                Err(e) => fail(e),
            }
        });

    let stats = warp::path!("stats" / String)
        .and(warp::get())
        .and(with_manager(manager.clone()))
        .and_then(|user_id: String, mgr: Arc<Manager>| async move {
            match mgr.stats(&user_id).await {
                Ok(stats) => ok(json!(stats)),
                Err(e) => fail(e),
            }
        });

    let export = warp::path!("export" / String)
        .and(warp::get())
        .and(with_manager(manager.clone()))
        .and_then(|user_id: String, mgr: Arc<Manager>| async move {
            match mgr.export_user(&user_id).await {
                Ok(payload) => ok(json!(payload)),
                Err(e) => fail(e),
            }
        });

    let import = warp::path!("import")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_manager(manager.clone()))
        .and_then(|payload: ExportPayload, mgr: Arc<Manager>| async move {
            match mgr.import_user(&payload).await {
                Ok(()) => ok(json!({})),
                Err(e) => fail(e),
            }
        });

    let forget = warp::path!("maintenance" / "forget" / String)
        .and(warp::post())
        .and(with_manager(manager.clone()))
        .and_then(|user_id: String, mgr: Arc<Manager>| async move {
            match mgr.run_forget(&user_id).await {
                Ok(removed) => ok(json!({ "removed_n": removed })),
                Err(e) => fail(e),
            }
        });

    let cleanup = warp::path!("maintenance" / "cleanup")
        .and(warp::post())
        .and(with_manager(manager.clone()))
        .and(with_cancel(cancel.clone()))
        .and_then(|mgr: Arc<Manager>, cancel: CancellationToken| async move {
            match mgr.cleanup_all(&cancel).await {
                Ok(removed) => ok(json!({ "removed_n": removed })),
                Err(e) => fail(e),
            }
        });

    let healthz = warp::path!("healthz")
        .and(warp::get())
        .and_then(|| async move { ok(json!({ "status": "ok" })) });

    session_start
        .or(session_message)
        .unify()
        .or(session_end)
        .unify()
        .or(context)
        .unify()
        .or(profile_get)
        .unify()
        .or(profile_put)
        .unify()
        .or(stats)
        .unify()
        .or(export)
        .unify()
        .or(import)
        .unify()
        .or(forget)
        .unify()
        .or(cleanup)
        .unify()
        .or(healthz)
        .unify()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;
    use crate::extract::rules::RuleExtractor;
    use crate::extract::Extractor;
    use crate::store::MemoryStore;

    async fn test_routes() -> impl Filter<Extract = (WithStatus<Json>,), Error = warp::Rejection> + Clone
    {
        let config = MemoryConfig {
            enable_cache: false,
            ..MemoryConfig::minimal()
        };
        let store = MemoryStore::connect("sqlite::memory:").await.unwrap();
        let extractor: Arc<dyn Extractor> =
            Arc::new(RuleExtractor::new(config.episode_summary_max_length));
        let manager = Arc::new(Manager::new(store, config, extractor, None));
        routes(manager, CancellationToken::new())
    }

    #[tokio::test]
    async fn healthz_responds_ok() {
        let api = test_routes().await;
        let res = warp::test::request().method("GET").path("/healthz").reply(&api).await;
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn message_to_unknown_session_is_404() {
        let api = test_routes().await;
        let res = warp::test::request()
            .method("POST")
            .path("/session/message")
            .json(&serde_json::json!({
                "session_id": "nope", "role": "user", "text": "你好"
            }))
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn short_session_flow_returns_null_episode() {
        let api = test_routes().await;
        let res = warp::test::request()
            .method("POST")
            .path("/session/start")
            .json(&serde_json::json!({ "user_id": "u1" }))
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
        let session_id = body["session_id"].as_str().unwrap().to_string();

        let res = warp::test::request()
            .method("POST")
            .path("/session/message")
            .json(&serde_json::json!({
                "session_id": session_id, "role": "user", "text": "你好"
            }))
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::OK);

        let res = warp::test::request()
            .method("POST")
            .path("/session/end")
            .json(&serde_json::json!({ "session_id": session_id }))
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
        assert!(body["episode"].is_null());
    }

    #[tokio::test]
    async fn missing_profile_is_404() {
        let api = test_routes().await;
        let res = warp::test::request().method("GET").path("/profile/u9").reply(&api).await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn bad_role_is_400() {
        let api = test_routes().await;
        let res = warp::test::request()
            .method("POST")
            .path("/session/message")
            .json(&serde_json::json!({
                "session_id": "s", "role": "narrator", "text": "hi"
            }))
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }
}

/// Serve until ctrl-c; the shared cancellation token fans out to every
/// in-flight manager call.
pub async fn serve(manager: Arc<Manager>, addr: SocketAddr) {
    let cancel = CancellationToken::new();
    let routes = routes(manager, cancel.clone());

    let (bound, fut) = warp::serve(routes).bind_with_graceful_shutdown(addr, {
        let cancel = cancel.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            cancel.cancel();
        }
    });
    info!(addr = %bound, "memory server listening");
    fut.await;
}
