#![cfg(feature = "http")]

use std::net::TcpListener;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rfrender::{
    ChallengeDisposition, Credential, EngineConfig, Error, HttpEngine, PostAction, RenderEngine,
    RenderOptions, RenderTask,
};
use tiny_http::{Header, Request, Response, Server};

/// Serve every request on a background thread and return the base URL.
fn serve<F>(handler: F) -> String
where
    F: Fn(Request) + Send + 'static,
{
    let server = Server::http("127.0.0.1:0").unwrap();
    let port = server.server_addr().to_ip().unwrap().port();
    thread::spawn(move || {
        for request in server.incoming_requests() {
            handler(request);
        }
    });
    format!("http://127.0.0.1:{}/", port)
}

fn html(body: &'static str) -> Response<std::io::Cursor<Vec<u8>>> {
    Response::from_string(body)
        .with_header(Header::from_bytes(&b"Content-Type"[..], &b"text/html"[..]).unwrap())
}

fn engine() -> Arc<HttpEngine> {
    let config = EngineConfig {
        timeout_ms: 5000,
        ..Default::default()
    };
    Arc::new(HttpEngine::new(config).unwrap())
}

fn options() -> RenderOptions {
    RenderOptions {
        timeout: Duration::from_secs(10),
        ..Default::default()
    }
}

#[test]
fn renders_served_document() {
    let url = serve(|req| {
        let _ = req.respond(html(
            "<html><head><title>Hello</title></head><body><p>served</p></body></html>",
        ));
    });
    let engine = engine();
    let mut task = RenderTask::new("served", &engine, options()).with_navigation(url.clone());
    task.start();

    assert!(task.error().is_none(), "{:?}", task.error());
    let outcome = task.outcome();
    let text = outcome.text().unwrap();
    assert!(text.contains("<title>Hello</title>"), "{}", text);
    assert!(text.contains("<p>served</p>"));
    let response = task.response().unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.url, url);
    assert_eq!(
        engine.evaluate_script("document.title").unwrap(),
        serde_json::json!("Hello")
    );
}

#[test]
fn error_status_still_finishes() {
    let url = serve(|req| {
        let _ = req.respond(html("<html><body>missing</body></html>").with_status_code(404));
    });
    let engine = engine();
    let mut task = RenderTask::new("missing", &engine, options()).with_navigation(url);
    task.start();

    assert!(task.is_finished());
    assert!(!task.is_cancelled());
    assert_eq!(task.response().map(|r| r.status), Some(404));
    assert!(task.outcome().text().unwrap().contains("missing"));
}

fn protected(req: Request) {
    let authorized = req.headers().iter().any(|h| {
        // user:pass
        h.field.equiv("Authorization") && h.value.as_str() == "Basic dXNlcjpwYXNz"
    });
    let response = if authorized {
        html("<html><body>secret</body></html>")
    } else {
        html("<html><body>denied</body></html>")
            .with_status_code(401)
            .with_header(
                Header::from_bytes(&b"WWW-Authenticate"[..], &br#"Basic realm="test""#[..])
                    .unwrap(),
            )
    };
    let _ = req.respond(response);
}

#[test]
fn basic_auth_through_handler() {
    let url = serve(protected);
    let engine = engine();
    let mut task = RenderTask::new("auth", &engine, options())
        .with_navigation(url)
        .with_auth_handler(|challenge| {
            assert_eq!(challenge.scheme, "Basic");
            assert_eq!(challenge.realm.as_deref(), Some("test"));
            ChallengeDisposition::UseCredential(Credential::new("user", "pass"))
        });
    task.start();

    assert_eq!(task.response().map(|r| r.status), Some(200));
    assert!(task.outcome().text().unwrap().contains("secret"));
}

#[test]
fn challenge_without_handler_keeps_unauthorized_response() {
    let url = serve(protected);
    let engine = engine();
    let mut task = RenderTask::new("no-auth", &engine, options()).with_navigation(url);
    task.start();

    assert_eq!(task.response().map(|r| r.status), Some(401));
    assert!(task.outcome().text().unwrap().contains("denied"));
}

#[test]
fn cancelled_challenge_fails_navigation() {
    let url = serve(protected);
    let engine = engine();
    let mut task = RenderTask::new("refused", &engine, options())
        .with_navigation(url)
        .with_auth_handler(|_| ChallengeDisposition::CancelAuthenticationChallenge);
    task.start();

    assert!(matches!(task.error(), Some(Error::NavigationError(_))));
    assert!(task.result().is_none());
}

#[test]
fn inline_script_posts_early_signal() {
    let url = serve(|req| {
        let _ = req.respond(html(
            r#"<html><body><p>early</p><script>rfrender.postMessage("doneLoading", { ok: true });</script></body></html>"#,
        ));
    });
    let engine = engine();
    let opts = RenderOptions {
        load_media_content: false,
        ..options()
    };
    let mut task = RenderTask::new("early", &engine, opts).with_navigation(url);
    task.start();

    assert!(task.error().is_none());
    assert!(task.outcome().text().unwrap().contains("<p>early</p>"));
    assert!(!engine.is_loading());
}

#[test]
fn validation_sees_page_script_state() {
    let url = serve(|req| {
        let _ = req.respond(html(
            "<html><body><script>window.ready = document.title === '';</script></body></html>",
        ));
    });
    let engine = engine();
    let mut task = RenderTask::new("validate", &engine, options())
        .with_navigation(url)
        .with_post_action(PostAction::Validate("window.ready === true".into()));
    task.start();

    assert!(task.error().is_none());
    assert!(!task.is_cancelled());
    assert!(task.result().is_some());
}

#[test]
fn refused_connection_is_a_provisional_failure() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let engine = engine();
    let mut task = RenderTask::new("refused", &engine, options())
        .with_navigation(format!("http://127.0.0.1:{}/", port));
    task.start();

    assert!(task.is_finished());
    assert!(matches!(task.error(), Some(Error::NavigationError(_))));
    assert!(task.response().is_none());
}

#[test]
fn invalid_url_fails_request_action() {
    let engine = engine();
    let mut task = RenderTask::new("bad", &engine, options()).with_navigation("not a url");
    task.start();

    assert!(matches!(task.error(), Some(Error::LoadError(_))));
}
