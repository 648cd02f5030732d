use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use prometheus::Registry;
use serde_json::{json, Value};

use agent::appender::{Appendable, ProcessQueueManager};
use agent::common::component::Component;
use agent::common::registry::Options;
use agent::discover::discover::Arguments;
use agent::http::{HttpClient, HttpRequest, HttpResponse};
use agent::input::prometheus::PrometheusInput;
use agent::input::runner::InputRunner;
use agent::input::PipelineContext;
use agent::scrape::manager::ScraperGroup;
use common::error::Result;

const CONFIG_NAME: &str = "test_config";
const JOB: &str = "_kube-state-metrics";

const TARGET_GROUPS: &str = r#"[
    {
        "targets": ["192.168.22.7:8080"],
        "labels": {
            "__meta_kubernetes_pod_controller_kind": "ReplicaSet",
            "__meta_kubernetes_namespace": "arms-prom",
            "__meta_kubernetes_pod_container_port_protocol": "TCP",
            "__meta_kubernetes_pod_host_ip": "192.168.21.234",
            "__meta_kubernetes_pod_ready": "true",
            "__address__": "192.168.22.7:8080",
            "__meta_kubernetes_pod_labelpresent_k8s_app": "true",
            "__meta_kubernetes_pod_label_k8s_app": "kube-state-metrics",
            "__meta_kubernetes_pod_container_port_number": "8080",
            "__meta_kubernetes_pod_ip": "192.168.22.7",
            "__meta_kubernetes_pod_phase": "Running",
            "__meta_kubernetes_pod_container_name": "kube-state-metrics",
            "__meta_kubernetes_pod_container_port_name": "http-metrics",
            "__meta_kubernetes_pod_name": "kube-state-metrics-64cf88c8f4-jtn6v"
        }
    },
    {
        "targets": ["192.168.22.31:6443"],
        "labels": {
            "__address__": "192.168.22.31:6443",
            "__meta_kubernetes_endpoint_port_protocol": "TCP",
            "__meta_kubernetes_service_name": "kubernetes",
            "__meta_kubernetes_endpoint_port_name": "https",
            "__meta_kubernetes_namespace": "default",
            "__meta_kubernetes_endpoint_ready": "true"
        }
    }
]"#;

/// Answers discovery requests with `TARGET_GROUPS` and everything else with
/// a small exposition body.
#[derive(Default)]
struct RoutingClient {
    discovery_requests: Mutex<Vec<HttpRequest>>,
}

#[async_trait]
impl HttpClient for RoutingClient {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        if request.path.starts_with("/jobs/") {
            self.discovery_requests.lock().unwrap().push(request);
            return Ok(HttpResponse {
                status: 200,
                body: TARGET_GROUPS.as_bytes().to_vec(),
            });
        }
        Ok(HttpResponse {
            status: 200,
            body: b"kube_pod_info 1\n".to_vec(),
        })
    }
}

#[derive(Default)]
struct CountingClient {
    calls: AtomicUsize,
}

#[async_trait]
impl HttpClient for CountingClient {
    async fn send(&self, _request: HttpRequest) -> Result<HttpResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(HttpResponse {
            status: 200,
            body: b"up 1\n".to_vec(),
        })
    }
}

struct Fixture {
    client: Arc<RoutingClient>,
    queues: Arc<ProcessQueueManager>,
    runner: Arc<InputRunner>,
}

impl Fixture {
    fn new() -> Fixture {
        let client = Arc::new(RoutingClient::default());
        let queues = Arc::new(ProcessQueueManager::default());
        queues.create_or_update_queue(CONFIG_NAME, 0);
        let opts = Options::new(
            Arguments::new("127.0.0.1", 8888, "collector-0"),
            Arc::new(Registry::new()),
        );
        let group = ScraperGroup::new(opts, client.clone(), queues.clone()).unwrap();
        Fixture {
            client,
            queues,
            runner: Arc::new(InputRunner::new(group)),
        }
    }

    fn input(&self) -> PrometheusInput {
        PrometheusInput::new(
            PipelineContext::new(CONFIG_NAME, CONFIG_NAME),
            Arc::clone(&self.runner),
        )
    }
}

fn static_config() -> Value {
    json!({
        "Type": "input_prometheus",
        "ScrapeConfig": {
            "job_name": "_arms-prom/node-exporter/0",
            "metrics_path": "/metrics",
            "scheme": "http",
            "scrape_interval": "15s",
            "scrape_timeout": "15s",
            "scrape_targets": [
                {"host": "172.17.0.3:9100"}
            ]
        }
    })
}

fn discovery_config() -> Value {
    json!({
        "Type": "input_prometheus",
        "ScrapeConfig": {
            "enable_http2": true,
            "follow_redirects": true,
            "honor_timestamps": false,
            "job_name": JOB,
            "kubernetes_sd_configs": [
                {
                    "enable_http2": true,
                    "follow_redirects": true,
                    "kubeconfig_file": "",
                    "namespaces": {"names": ["arms-prom"], "own_namespace": false},
                    "role": "pod"
                }
            ],
            "metrics_path": "/metrics",
            "relabel_configs": [
                {
                    "action": "keep",
                    "regex": "kube-state-metrics",
                    "replacement": "$1",
                    "separator": ";",
                    "source_labels": ["__meta_kubernetes_pod_label_k8s_app"]
                },
                {
                    "action": "keep",
                    "regex": "8080",
                    "replacement": "$1",
                    "separator": ";",
                    "source_labels": ["__meta_kubernetes_pod_container_port_number"]
                },
                {
                    "action": "replace",
                    "regex": "([^:]+)(?::\\d+)?;(\\d+)",
                    "replacement": "$1:$2",
                    "separator": ";",
                    "source_labels": ["__address__", "__meta_kubernetes_pod_container_port_number"],
                    "target_label": "__address__"
                }
            ],
            "scheme": "http",
            "scrape_interval": "3s",
            "scrape_timeout": "3s"
        }
    })
}

#[tokio::test]
async fn init_keeps_configured_job_fields() {
    let fixture = Fixture::new();
    let mut input = fixture.input();

    assert!(input.init(&json!({"Type": "input_prometheus"})).is_err());
    assert!(input.scrape_job().is_none());

    input.init(&static_config()).unwrap();
    let job = input.scrape_job().unwrap();
    assert_eq!(job.job_name(), "_arms-prom/node-exporter/0");
    assert_eq!(job.metrics_path(), "/metrics");
    assert_eq!(job.scrape_interval_string(), "15s");
    assert_eq!(job.scrape_timeout_string(), "15s");
}

#[tokio::test(start_paused = true)]
async fn pipeline_start_and_stop_toggle_registration() {
    let fixture = Fixture::new();
    let mut input = fixture.input();
    input.init(&static_config()).unwrap();

    input.start().await.unwrap();
    assert!(fixture.runner.has_input(CONFIG_NAME));
    assert!(fixture.runner.group().job("_arms-prom/node-exporter/0").is_some());

    input.stop(true).await.unwrap();
    assert!(!fixture.runner.has_input(CONFIG_NAME));
    assert!(fixture.runner.group().job("_arms-prom/node-exporter/0").is_none());

    fixture.runner.stop().await;
}

#[tokio::test(start_paused = true)]
async fn discovered_target_is_relabeled_and_scraped() {
    let fixture = Fixture::new();
    let mut input = fixture.input();
    input.init(&discovery_config()).unwrap();
    input.start().await.unwrap();
    tokio::time::sleep(Duration::from_secs(6)).await;

    let requests = fixture.client.discovery_requests.lock().unwrap().clone();
    assert!(!requests.is_empty());
    assert_eq!(requests[0].path, "/jobs/_kube-state-metrics/targets");
    assert_eq!(requests[0].query, "collector_id=collector-0");
    assert_eq!(requests[0].host, "127.0.0.1");
    assert_eq!(requests[0].port, 8888);

    let group = fixture.runner.group();
    let snapshot = group.targets_snapshot(JOB).unwrap();
    assert_eq!(snapshot.len(), 1);
    let (hash, target) = snapshot.iter().next().unwrap();
    assert!(hash.contains("192.168.22.7"));
    assert_eq!(target.targets[0], "192.168.22.7:8080");
    assert_eq!(target.labels.len(), 6);
    assert_eq!(target.job_name, JOB);
    assert_eq!(target.metrics_path, "/metrics");
    assert_eq!(target.scheme, "http");
    assert_eq!(target.host, "192.168.22.7");
    assert_eq!(target.port, 8080);
    assert_eq!(target.scrape_interval, Duration::from_secs(3));
    assert_eq!(target.scrape_timeout, Duration::from_secs(3));

    let sample = fixture.queues.pop(CONFIG_NAME).unwrap();
    assert_eq!(sample.job_name, JOB);
    assert_eq!(sample.body, b"kube_pod_info 1\n".to_vec());
    assert_eq!(sample.labels.get("instance"), Some("192.168.22.7:8080"));

    fixture.runner.stop().await;
}

#[tokio::test(start_paused = true)]
async fn restarted_work_uses_the_injected_client() {
    let fixture = Fixture::new();
    let mut input = fixture.input();
    input.init(&discovery_config()).unwrap();
    input.start().await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    let group = fixture.runner.group();
    let hash = group
        .targets_snapshot(JOB)
        .unwrap()
        .keys()
        .next()
        .cloned()
        .unwrap();
    let work = group.get_work(JOB, &hash).unwrap();

    let client = Arc::new(CountingClient::default());
    work.stop_scrape_loop().await;
    assert!(!work.is_running());
    assert_eq!(client.calls.load(Ordering::SeqCst), 0);

    work.set_client(client.clone());
    work.start_scrape_loop();
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(client.calls.load(Ordering::SeqCst), 1);

    fixture.runner.stop().await;
    assert!(!work.is_running());
}
