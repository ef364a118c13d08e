use std::time::Duration;

use redirect_tracer::{GeoLocationConfig, GeoLocationError, GeoLocator, IpApiLocator};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn locator(server: &MockServer, timeout_ms: u64) -> IpApiLocator {
    IpApiLocator::new(GeoLocationConfig {
        enabled: true,
        endpoint: format!("{}/json", server.uri()),
        timeout_ms,
    })
}

#[tokio::test]
async fn resolves_exit_ip_and_location() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "status": "success",
            "country": "Germany",
            "countryCode": "DE",
            "regionName": "Hesse",
            "city": "Frankfurt am Main",
            "query": "203.0.113.7"
        })))
        .mount(&server)
        .await;

    let lookup = locator(&server, 2_000).locate(None).await.unwrap();
    assert_eq!(lookup.ip, "203.0.113.7");
    assert_eq!(lookup.location.country.as_deref(), Some("Germany"));
    assert_eq!(lookup.location.region.as_deref(), Some("Hesse"));
}

#[tokio::test]
async fn provider_failure_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "status": "fail",
            "message": "reserved range"
        })))
        .mount(&server)
        .await;

    let err = locator(&server, 2_000).locate(None).await.unwrap_err();
    assert!(matches!(err, GeoLocationError::Provider(ref message) if message == "reserved range"));
}

#[tokio::test]
async fn slow_service_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/json"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;

    let err = locator(&server, 100).locate(None).await.unwrap_err();
    assert!(matches!(err, GeoLocationError::Timeout(_)));
}

#[tokio::test]
async fn http_error_status_fails_lookup() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/json"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let err = locator(&server, 2_000).locate(None).await.unwrap_err();
    assert!(matches!(err, GeoLocationError::Http(_)));
}
