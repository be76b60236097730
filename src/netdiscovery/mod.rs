//! Network discovery task.
//!
//! Drives each [`NetDiscoveryJob`] with a bounded pool of probe workers. The
//! coordinator is the only owner of the job: workers get an address and
//! probe settings by value and hand back what they found.

mod credentials;
mod job;
mod range;

pub use credentials::*;
pub use job::*;
pub use range::*;

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

use crate::client::AGENT_VERSION;
use crate::config::AgentConfig;
use crate::probe::{ping, snmp_get, tcp_connect, SnmpVersion, WalkFile, SYS_DESCR_OID};
use crate::task::{TaskContext, TaskError, TaskOutcome};

/// What a worker learned about one address.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub struct DiscoveredDevice {
    pub ip: String,
    pub alive: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Id of the SNMP credential that answered
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authsnmp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authport: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authprotocol: Option<String>,
    /// Id of the remote credential whose port answered
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authremote: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remoteport: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity: Option<Value>,
}

impl DiscoveredDevice {
    fn answered(&self) -> bool {
        self.alive || self.description.is_some() || self.authremote.is_some()
    }
}

/// Probe settings for one address, moved into its worker.
#[derive(Debug, Clone)]
struct AddressProbe {
    ip: Ipv4Addr,
    timeout: Duration,
    ports: Vec<u16>,
    domains: Vec<SnmpDomain>,
    snmp_credentials: Vec<Credential>,
    remote_credentials: Vec<Credential>,
    entity: Option<Value>,
    walk: Option<Arc<WalkFile>>,
}

impl AddressProbe {
    async fn run(self) -> Option<DiscoveredDevice> {
        let mut device = DiscoveredDevice {
            ip: self.ip.to_string(),
            entity: self.entity.clone(),
            ..Default::default()
        };

        // Replayed devices answer from the walk file only
        if let Some(walk) = &self.walk {
            device.description = walk.get(SYS_DESCR_OID).map(str::to_string);
            device.authsnmp = self.snmp_credentials.first().and_then(|c| c.id.clone());
            return Some(device).filter(DiscoveredDevice::answered);
        }

        match ping(self.ip, self.timeout).await {
            Ok(rtt) => {
                tracing::trace!("{}: ping answered in {:?}", self.ip, rtt);
                device.alive = true;
            }
            Err(e) if e.is_silence() => {}
            Err(e) => tracing::debug!("{}: ping failed: {}", self.ip, e),
        }

        self.probe_snmp(&mut device).await;
        self.probe_remote(&mut device).await;

        Some(device).filter(DiscoveredDevice::answered)
    }

    async fn probe_snmp(&self, device: &mut DiscoveredDevice) {
        let ports = if self.ports.is_empty() { vec![161] } else { self.ports.clone() };
        let domains = if self.domains.is_empty() {
            vec![SnmpDomain::Udp]
        } else {
            self.domains.clone()
        };

        for credential in &self.snmp_credentials {
            let version = match SnmpVersion::parse(credential.version.as_deref()) {
                Ok(version) => version,
                Err(e) => {
                    tracing::debug!("{}: skipping credential {:?}: {}", self.ip, credential.id, e);
                    continue;
                }
            };
            let community = credential.community.as_deref().unwrap_or("public");

            for port in &ports {
                for domain in domains.iter().filter(|d| d.is_udp_ipv4()) {
                    match snmp_get(self.ip, *port, version, community, SYS_DESCR_OID, self.timeout).await {
                        Ok(description) => {
                            device.description = Some(description);
                            device.authsnmp = credential.id.clone();
                            device.authport = Some(*port);
                            device.authprotocol = Some(domain.to_string());
                            return;
                        }
                        Err(e) => tracing::trace!("{}: no SNMP answer on {}/{}: {}", self.ip, domain, port, e),
                    }
                }
            }
        }
    }

    async fn probe_remote(&self, device: &mut DiscoveredDevice) {
        for credential in &self.remote_credentials {
            let Some(port) = credential.remote_port() else {
                continue;
            };
            if tcp_connect(self.ip, port, self.timeout).await.is_ok() {
                device.authremote = credential.id.clone();
                device.remoteport = Some(port);
                return;
            }
        }
    }
}

/// Range given on the command line style: `a.b.c.d`, `first-last` or a CIDR block.
pub fn parse_range(spec: &str) -> RangeConfig {
    let spec = spec.trim();
    if let Some((first, last)) = spec.split_once('-') {
        return RangeConfig::new(first.trim(), last.trim());
    }
    if let Some((network, prefix)) = spec.split_once('/') {
        if let (Ok(network), Ok(prefix)) = (network.trim().parse::<Ipv4Addr>(), prefix.trim().parse::<u32>()) {
            if prefix <= 32 {
                let mask = u32::MAX.checked_shl(32 - prefix).unwrap_or(0);
                let first = u32::from(network) & mask;
                let last = first | !mask;
                // Network and broadcast addresses are skipped for real subnets
                let (first, last) = if prefix < 31 { (first + 1, last - 1) } else { (first, last) };
                return RangeConfig::new(&Ipv4Addr::from(first).to_string(), &Ipv4Addr::from(last).to_string());
            }
        }
    }
    RangeConfig::new(spec, spec)
}

/// Job built from the `netdiscovery-*` options, if a range is configured.
pub fn local_job(config: &AgentConfig) -> Option<NetDiscoveryJobConfig> {
    if config.netdiscovery_range.is_empty() {
        return None;
    }

    let ranges = config
        .netdiscovery_range
        .iter()
        .map(|spec| {
            let mut range = parse_range(spec);
            if !config.netdiscovery_port.is_empty() {
                range.ports = Some(Value::from(config.netdiscovery_port.clone()));
            }
            if !config.netdiscovery_domain.is_empty() {
                range.domains = Some(Value::from(config.netdiscovery_domain.clone()));
            }
            range
        })
        .collect();

    let communities = if config.netdiscovery_community.is_empty() {
        vec!["public".to_string()]
    } else {
        config.netdiscovery_community.clone()
    };
    let credentials = communities
        .into_iter()
        .enumerate()
        .map(|(i, community)| Credential {
            id: Some((i + 1).to_string()),
            cred_type: Some("snmp".to_string()),
            version: Some("1".to_string()),
            community: Some(community),
            ..Default::default()
        })
        .collect();

    let params = BTreeMap::from([
        ("PID".to_string(), json!(Utc::now().timestamp())),
        ("THREADS_DISCOVERY".to_string(), json!(config.netdiscovery_threads)),
    ]);

    Some(NetDiscoveryJobConfig {
        params,
        ranges,
        credentials: JobCredentials::Shared(credentials),
        file: config.netdiscovery_walk.clone(),
        localtask: true,
        ..Default::default()
    })
}

/// Jobs sent by the server, else the locally configured one. Server jobs
/// that can't be decoded are logged and skipped.
fn jobs_for(ctx: &TaskContext) -> Vec<NetDiscoveryJobConfig> {
    let jobs = ctx
        .response
        .as_ref()
        .and_then(|contact| contact.task("netdiscovery"))
        .and_then(|task| task.jobs.clone());

    let what = format!("discovery job for {}", ctx.target_id);
    match jobs {
        Some(list @ Value::Array(_)) => lenient_entries(list, &what),
        Some(job @ Value::Object(_)) => lenient_entries(Value::Array(vec![job]), &what),
        _ => local_job(&ctx.config).into_iter().collect(),
    }
}

/// Run every discovery job for this target.
pub async fn run(ctx: &TaskContext) -> Result<TaskOutcome, TaskError> {
    let jobs = jobs_for(ctx);
    if jobs.is_empty() {
        tracing::debug!("NetDiscovery task execution not requested");
        return Ok(TaskOutcome::default());
    }

    if let Some(previous) = &ctx.cache {
        tracing::debug!("target {}: previous discovery: {}", ctx.target_id, previous);
    }

    let request_timeout = Duration::from_secs(ctx.config.netdiscovery_timeout.max(1));
    let mut summary = Vec::new();

    for config in jobs {
        let mut job = NetDiscoveryJob::new(config);
        let devices = run_job(ctx, &mut job, request_timeout).await;
        tracing::info!(
            "target {}: discovery job {} found {} devices over {} addresses",
            ctx.target_id,
            job.pid(),
            devices.len(),
            job.queuesize()
        );

        if let Err(e) = report(ctx, &job, &devices).await {
            tracing::error!("target {}: can't report discovery job {}: {}", ctx.target_id, job.pid(), e);
        }
        if job.control() {
            send_control(ctx, job.pid(), "END").await;
        }
        summary.push(json!({
            "pid": job.pid(),
            "addresses": job.queuesize(),
            "devices": devices.len(),
        }));
    }

    Ok(TaskOutcome {
        cache: Some(json!({
            "last_run": Utc::now().timestamp(),
            "jobs": summary,
        })),
    })
}

/// Probe every address of a job, at most `max_threads` at once.
async fn run_job(ctx: &TaskContext, job: &mut NetDiscoveryJob, request_timeout: Duration) -> Vec<DiscoveredDevice> {
    let mut devices = Vec::new();
    if job.ranges().is_empty() {
        tracing::info!("target {}: no valid range in discovery job {}", ctx.target_id, job.pid());
        return devices;
    }

    let walk = match job.snmpwalk().cloned() {
        Some(path) => match WalkFile::load(&path) {
            Ok(walk) => {
                tracing::debug!("target {}: replaying {} values from {}", ctx.target_id, walk.len(), path.display());
                Some(Arc::new(walk))
            }
            Err(e) => {
                tracing::warn!("target {}: {}", ctx.target_id, e);
                None
            }
        },
        None => None,
    };

    if !job.started() {
        tracing::info!(
            "target {}: starting network discovery job {} on {} addresses",
            ctx.target_id,
            job.pid(),
            job.queuesize()
        );
        if job.control() {
            send_control(ctx, job.pid(), "START").await;
        }
    }

    let deadline = Duration::from_secs(job.timeout());
    let request_timeout = request_timeout.min(deadline);
    let mut workers = JoinSet::new();

    loop {
        while !job.max_in_queue() {
            let Some(ip) = job.nextip() else {
                if job.range().is_some() {
                    continue;
                }
                break;
            };
            // The range that issued the address is still at the front
            let Some(range) = job.range() else {
                break;
            };
            let probe = AddressProbe {
                ip,
                timeout: request_timeout,
                ports: range.ports.clone(),
                domains: range.domains.clone(),
                snmp_credentials: range.snmp_credentials.clone(),
                remote_credentials: range.remote_credentials.clone(),
                entity: range.entity.clone(),
                walk: walk.clone(),
            };
            workers.spawn(async move {
                match tokio::time::timeout(deadline, probe.run()).await {
                    Ok(device) => device,
                    Err(_) => {
                        tracing::debug!("{}: probing took more than {:?}", ip, deadline);
                        None
                    }
                }
            });
        }

        let Some(result) = workers.join_next().await else {
            break;
        };
        match result {
            Ok(Some(device)) => {
                tracing::debug!("target {}: found device at {}", ctx.target_id, device.ip);
                devices.push(device);
            }
            Ok(None) => {}
            Err(e) => tracing::error!("target {}: discovery worker failed: {}", ctx.target_id, e),
        }
        if job.done() {
            break;
        }
    }

    devices.sort_by_key(|d| d.ip.parse::<Ipv4Addr>().map(u32::from).unwrap_or(u32::MAX));
    devices
}

async fn send_control(ctx: &TaskContext, pid: u64, step: &str) {
    let Some(url) = ctx.server_url() else {
        return;
    };
    let mut agent = serde_json::Map::new();
    agent.insert(step.to_string(), json!(1));
    let content = json!({
        "AGENT": agent,
        "MODULEVERSION": AGENT_VERSION,
        "PROCESSNUMBER": pid,
    });
    if let Err(e) = ctx.client.submit(url, &ctx.deviceid, "netdiscovery", content).await {
        tracing::warn!("target {}: can't send discovery {} message: {}", ctx.target_id, step, e);
    }
}

/// Write results to the local directory or post them to the server.
async fn report(ctx: &TaskContext, job: &NetDiscoveryJob, devices: &[DiscoveredDevice]) -> Result<(), TaskError> {
    let content = json!({
        "DEVICE": devices,
        "MODULEVERSION": AGENT_VERSION,
        "PROCESSNUMBER": job.pid(),
    });

    if let Some(url) = ctx.server_url() {
        ctx.client.submit(url, &ctx.deviceid, "netdiscovery", content).await?;
        return Ok(());
    }

    let Some(path) = ctx.local_path() else {
        return Ok(());
    };
    let document = serde_json::to_string_pretty(&json!({
        "action": "netdiscovery",
        "deviceid": ctx.deviceid,
        "content": content,
    }))?;

    if path.as_os_str() == "-" {
        println!("{}", document);
        return Ok(());
    }

    tokio::fs::create_dir_all(path).await?;
    let file = path.join(format!(
        "netdiscovery-{}-{}.json",
        job.pid(),
        Utc::now().format("%Y-%m-%d-%H-%M-%S")
    ));
    tokio::fs::write(&file, document).await?;
    tracing::info!("target {}: discovery results saved in {}", ctx.target_id, file.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{Client, Contact};
    use crate::target::TargetKind;
    use crate::task::TaskKind;
    use axum::{extract::State, routing::post, Json, Router};
    use std::io::Write;
    use std::sync::Mutex;
    use tempfile::NamedTempFile;

    const WALK: &str = "SNMPv2-MIB::sysDescr.0 = STRING: \"Test switch\"\n";

    fn context(kind: TargetKind, config: AgentConfig) -> TaskContext {
        TaskContext {
            task: TaskKind::NetDiscovery,
            target_id: "test0".into(),
            target_kind: kind,
            deviceid: "test-device".into(),
            config: Arc::new(config),
            event: None,
            response: None,
            cache: None,
            client: Client::new(Duration::from_secs(5)).unwrap(),
        }
    }

    fn walk_file() -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(WALK.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_parse_range() {
        let range = parse_range("10.0.0.1-10.0.0.9");
        assert_eq!(range.start.as_deref(), Some("10.0.0.1"));
        assert_eq!(range.end.as_deref(), Some("10.0.0.9"));

        let range = parse_range("192.168.1.0/24");
        assert_eq!(range.start.as_deref(), Some("192.168.1.1"));
        assert_eq!(range.end.as_deref(), Some("192.168.1.254"));

        let range = parse_range("192.168.1.7/32");
        assert_eq!(range.start.as_deref(), Some("192.168.1.7"));
        assert_eq!(range.end.as_deref(), Some("192.168.1.7"));

        let range = parse_range("host.example");
        assert_eq!(range.start.as_deref(), Some("host.example"));
    }

    #[test]
    fn test_local_job_from_config() {
        assert!(local_job(&AgentConfig::default()).is_none());

        let config = AgentConfig {
            netdiscovery_range: vec!["10.0.0.1-10.0.0.4".into(), "10.0.1.1".into()],
            netdiscovery_community: vec!["public".into(), "private".into()],
            netdiscovery_threads: 4,
            netdiscovery_port: vec!["161".into(), "1161".into()],
            ..Default::default()
        };
        let mut job = NetDiscoveryJob::new(local_job(&config).unwrap());
        assert_eq!(job.max_threads(), 4);
        assert!(job.localtask());
        assert_eq!(job.queuesize(), 5);
        assert_eq!(job.snmp_credentials().len(), 2);
        assert_eq!(job.range().unwrap().ports, vec![161, 1161]);
    }

    #[test]
    fn test_server_jobs_win_over_config() {
        let config = AgentConfig {
            netdiscovery_range: vec!["10.0.0.1".into()],
            ..Default::default()
        };
        let mut ctx = context(TargetKind::Local { path: "-".into() }, config);
        assert_eq!(jobs_for(&ctx).len(), 1);

        ctx.response = Some(
            serde_json::from_value::<Contact>(json!({
                "status": "ok",
                "expiration": "1h",
                "tasks": {"netdiscovery": {"server": "glpi", "jobs": [
                    {"params": {"PID": 12, "THREADS_DISCOVERY": 3},
                     "ranges": [{"IPSTART": "10.1.0.1", "IPEND": "10.1.0.2"}]},
                    {"params": {"PID": 13}, "ranges": []}
                ]}}
            }))
            .unwrap(),
        );
        let jobs = jobs_for(&ctx);
        assert_eq!(jobs.len(), 2);
        let job = NetDiscoveryJob::new(jobs[0].clone());
        assert_eq!(job.pid(), 12);
        assert_eq!(job.max_threads(), 3);
    }

    #[test]
    fn test_malformed_server_job_is_skipped() {
        let mut ctx = context(TargetKind::Local { path: "-".into() }, AgentConfig::default());
        ctx.response = Some(
            serde_json::from_value::<Contact>(json!({
                "status": "ok",
                "expiration": "1h",
                "tasks": {"netdiscovery": {"jobs": [
                    {"params": "garbage"},
                    {"params": {"PID": 21},
                     "ranges": [{"NAME": 12, "IPSTART": "10.2.0.1", "IPEND": "10.2.0.3"}, "10.9.9.9"],
                     "credentials": [
                        {"ID": 1, "TYPE": "snmp", "VERSION": "2c", "COMMUNITY": "public"},
                        null
                     ]}
                ]}}
            }))
            .unwrap(),
        );

        let jobs = jobs_for(&ctx);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].ranges.len(), 1);
        assert_eq!(jobs[0].ranges[0].name.as_deref(), Some("12"));
        match &jobs[0].credentials {
            JobCredentials::Shared(list) => assert_eq!(list.len(), 1),
            other => panic!("unexpected credentials {:?}", other),
        }

        let mut job = NetDiscoveryJob::new(jobs[0].clone());
        assert_eq!(job.pid(), 21);
        assert_eq!(job.queuesize(), 3);
    }

    #[tokio::test]
    async fn test_no_job_requested() {
        let ctx = context(TargetKind::Local { path: "-".into() }, AgentConfig::default());
        let outcome = run(&ctx).await.unwrap();
        assert!(outcome.cache.is_none());
    }

    #[tokio::test]
    async fn test_walk_replay_writes_local_results() {
        let walk = walk_file();
        let dir = tempfile::tempdir().unwrap();
        let config = AgentConfig {
            netdiscovery_range: vec!["192.0.2.1-192.0.2.3".into()],
            netdiscovery_threads: 2,
            netdiscovery_walk: Some(walk.path().to_path_buf()),
            ..Default::default()
        };
        let ctx = context(
            TargetKind::Local {
                path: dir.path().to_path_buf(),
            },
            config,
        );

        let outcome = run(&ctx).await.unwrap();
        let cache = outcome.cache.unwrap();
        assert_eq!(cache["jobs"][0]["devices"], 3);
        assert_eq!(cache["jobs"][0]["addresses"], 3);

        let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().map(|e| e.unwrap().path()).collect();
        assert_eq!(files.len(), 1);
        let name = files[0].file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("netdiscovery-") && name.ends_with(".json"));

        let saved: Value = serde_json::from_str(&std::fs::read_to_string(&files[0]).unwrap()).unwrap();
        let devices = saved["content"]["DEVICE"].as_array().unwrap();
        assert_eq!(devices[0]["IP"], "192.0.2.1");
        assert_eq!(devices[2]["DESCRIPTION"], "Test switch");
        assert_eq!(devices[0]["AUTHSNMP"], "1");
    }

    #[tokio::test]
    async fn test_remote_port_probe() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((_socket, _)) = listener.accept().await {}
        });

        let probe = AddressProbe {
            ip: Ipv4Addr::LOCALHOST,
            timeout: Duration::from_secs(1),
            ports: vec![],
            domains: vec![],
            snmp_credentials: vec![],
            remote_credentials: vec![Credential {
                id: Some("7".into()),
                cred_type: Some("ssh".into()),
                username: Some("admin".into()),
                port: Some(json!(port)),
                ..Default::default()
            }],
            entity: Some(json!(2)),
            walk: None,
        };
        let device = probe.run().await.unwrap();
        assert_eq!(device.authremote.as_deref(), Some("7"));
        assert_eq!(device.remoteport, Some(port));
        assert_eq!(device.entity, Some(json!(2)));
    }

    #[tokio::test]
    async fn test_server_results_and_control_messages() {
        let received: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
        let app = Router::new()
            .route(
                "/",
                post(|State(received): State<Arc<Mutex<Vec<Value>>>>, Json(body): Json<Value>| async move {
                    received.lock().unwrap().push(body);
                    Json(json!({"status": "ok"}))
                }),
            )
            .with_state(received.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let walk = walk_file();
        let mut ctx = context(TargetKind::Server { url }, AgentConfig::default());
        ctx.response = Some(
            serde_json::from_value::<Contact>(json!({
                "status": "ok",
                "expiration": "1h",
                "tasks": {"netdiscovery": {"jobs": {
                    "params": {"PID": 42},
                    "ranges": [{"IPSTART": "198.51.100.5", "IPEND": "198.51.100.5"}],
                    "file": walk.path(),
                    "control": true
                }}}
            }))
            .unwrap(),
        );

        run(&ctx).await.unwrap();

        let received = received.lock().unwrap();
        assert_eq!(received.len(), 3);
        assert!(received.iter().all(|m| m["action"] == "netdiscovery" && m["deviceid"] == "test-device"));
        assert_eq!(received[0]["content"]["AGENT"]["START"], 1);
        assert_eq!(received[1]["content"]["PROCESSNUMBER"], 42);
        assert_eq!(received[1]["content"]["DEVICE"][0]["IP"], "198.51.100.5");
        assert_eq!(received[2]["content"]["AGENT"]["END"], 1);
    }
}
