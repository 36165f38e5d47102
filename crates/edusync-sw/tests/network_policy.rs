//! Fetch policy over the real HTTP loader, with the loader's origin taken
//! from the worker scope.

use std::sync::Arc;

use edusync_net::{LoaderConfig, Request, ResponseType};
use edusync_sw::{
    CacheKey, CacheStore, ExtendableEvent, FetchOutcome, FetchPolicy, MemoryCacheStorage,
    ResponseSource, WorkerConfig,
};
use tracing_subscriber::EnvFilter;
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn serving(route: &str, body: &str) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(&server)
        .await;
    server
}

fn root(server: &MockServer) -> Url {
    Url::parse(&format!("{}/", server.uri())).unwrap()
}

#[tokio::test]
async fn only_scope_origin_responses_are_stored() {
    init_tracing();
    let app = serving("/report/", "term report").await;
    let cdn = serving("/lib.js", "lib()").await;

    let config = WorkerConfig::default().with_scope(root(&app));
    let loader = config.resource_loader(LoaderConfig::default()).unwrap();
    let cache_name = config.cache_name.clone();
    let store = Arc::new(MemoryCacheStorage::new());
    let policy = FetchPolicy::new(Arc::new(config), store.clone(), Arc::new(loader)).unwrap();

    let foreign = root(&cdn).join("lib.js").unwrap();
    let mut lifetime = ExtendableEvent::new();
    let FetchOutcome::Respond(response, source) =
        policy.handle(&Request::get(foreign.clone()), &mut lifetime).await
    else {
        panic!("cross-origin request was not intercepted");
    };
    lifetime.settle().await;
    assert_eq!(source, ResponseSource::Network { stored: false });
    assert_eq!(response.response_type, ResponseType::Cors);
    assert_eq!(response.text().await.unwrap(), "lib()");
    assert!(store
        .match_key(&cache_name, &CacheKey::get(&foreign))
        .await
        .unwrap()
        .is_none());

    let own = root(&app).join("report/").unwrap();
    let mut lifetime = ExtendableEvent::new();
    let FetchOutcome::Respond(response, source) =
        policy.handle(&Request::get(own.clone()), &mut lifetime).await
    else {
        panic!("same-origin request was not intercepted");
    };
    assert_eq!(source, ResponseSource::Network { stored: true });
    assert_eq!(response.response_type, ResponseType::Basic);
    assert_eq!(response.text().await.unwrap(), "term report");
    lifetime.settle().await;

    let entry = store
        .match_key(&cache_name, &CacheKey::get(&own))
        .await
        .unwrap()
        .expect("same-origin response was stored");
    assert_eq!(entry.body, b"term report");
}
