//! Command dispatch for the RPC layer
//!
//! Every command answers with a [`CommandResponse`]; failures are reported in
//! the response, never raised.

use crate::certs::CertificateIssuer;
use crate::control::ControlLoop;
use crate::error::{CommandResponse, SupervisorError};
use crate::supervisor::{normalize_domain, LaunchOutcome};
use tracing::{debug, info};

impl<I: CertificateIssuer + 'static> ControlLoop<I> {
    /// Run a named command such as `web.create` or `ssl.renew`
    pub async fn dispatch(&self, command: &str, args: &[String]) -> CommandResponse {
        debug!(command, args = ?args, "Dispatching command");
        let arg = |i: usize| args.get(i).map(String::as_str);

        let response = match (command, arg(0), arg(1)) {
            ("web.create", Some(domain), Some(path)) => {
                let result = self.websites().create(domain, path);
                match result {
                    Ok(site) => CommandResponse::ok(format!("Website {} created at {}", site.domain, site.path)),
                    Err(e) => CommandResponse::fail(e.to_string()),
                }
            }
            ("web.delete", Some(domain), _) => CommandResponse::from_result(
                self.websites().delete(domain).await,
                format!("Website {} deleted", domain.trim()),
            ),
            ("web.restart", Some(domain), _) => {
                launch_response(self.websites().restart(domain).await, "Website", domain)
            }
            ("web.logs", Some(domain), _) => match normalize_domain(domain).and_then(|d| self.websites().logs(&d)) {
                Ok(logs) => CommandResponse::ok(logs),
                Err(e) => CommandResponse::fail(e.to_string()),
            },
            ("web.list", _, _) => match self.websites().list() {
                Ok(sites) => CommandResponse::ok(
                    sites
                        .iter()
                        .map(|s| s.domain.as_str())
                        .collect::<Vec<_>>()
                        .join("\n"),
                ),
                Err(e) => CommandResponse::fail(e.to_string()),
            },
            ("service.start", Some(target), _) => self.start_service(target).await,
            ("service.stop", Some(target), _) => CommandResponse::from_result(
                self.services().stop(target).await,
                format!("Service {} stopped", target),
            ),
            ("service.restart", Some(target), _) => {
                launch_response(self.services().restart(target).await, "Service", target)
            }
            ("service.delete", Some(target), _) => CommandResponse::from_result(
                self.services().delete(target).await,
                format!("Service {} deleted", target),
            ),
            ("service.logs", Some(target), _) => {
                match self.services().resolve(target).and_then(|key| self.services().logs(&key)) {
                    Ok(logs) => CommandResponse::ok(logs),
                    Err(e) => CommandResponse::fail(e.to_string()),
                }
            }
            ("service.list", _, _) => match self.services().list() {
                Ok(services) => CommandResponse::ok(
                    services
                        .iter()
                        .map(|s| format!("{} {} {}", s.id, s.name, s.lifecycle.status.as_str()))
                        .collect::<Vec<_>>()
                        .join("\n"),
                ),
                Err(e) => CommandResponse::fail(e.to_string()),
            },
            ("ssl.renew", Some(domain), _) => self.certs().renew_command(domain).await,
            _ => CommandResponse::fail(format!("Unknown command or missing arguments: {}", command)),
        };

        info!(command, result = response.result, "Command handled");
        response
    }

    /// Start a known service by id or name, or register a new one from a file path
    async fn start_service(&self, target: &str) -> CommandResponse {
        let services = self.services();
        match services.resolve(target) {
            Ok(_) => launch_response(services.start(target).await, "Service", target),
            Err(SupervisorError::UnknownResource { .. }) => match services.add(target).await {
                Ok(service) => {
                    services.launch(&service.id.to_string());
                    CommandResponse::ok(format!("Service {} added", service.name))
                }
                Err(e) => CommandResponse::fail(e.to_string()),
            },
            Err(e) => CommandResponse::fail(e.to_string()),
        }
    }
}

fn launch_response(
    result: Result<LaunchOutcome, SupervisorError>,
    kind: &str,
    name: &str,
) -> CommandResponse {
    match result {
        Ok(LaunchOutcome::Started(pid)) => {
            CommandResponse::ok(format!("{} {} started (pid {})", kind, name.trim(), pid))
        }
        Ok(LaunchOutcome::AlreadyRunning) | Ok(LaunchOutcome::InFlight) => {
            CommandResponse::ok(format!("{} {} is running", kind, name.trim()))
        }
        Ok(LaunchOutcome::Deferred(gate)) => {
            CommandResponse::fail(format!("{} {} cannot start yet: {:?}", kind, name.trim(), gate))
        }
        Ok(LaunchOutcome::NotFound) => CommandResponse::fail(format!("{} {} not found", kind, name.trim())),
        Ok(LaunchOutcome::Failed) => {
            CommandResponse::fail(format!("{} {} failed to start, see its log", kind, name.trim()))
        }
        Err(e) => CommandResponse::fail(e.to_string()),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::certs::{self_signed, IssuedCertificate};
    use crate::config::Config;
    use crate::dns::{DnsBackend, MemoryDns};
    use crate::error::CertError;
    use crate::store::ConfigStore;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct SelfSigned;

    impl CertificateIssuer for SelfSigned {
        async fn issue(
            &self,
            names: &[String],
            _dns: &dyn DnsBackend,
        ) -> Result<IssuedCertificate, CertError> {
            self_signed(names, 90)
        }
    }

    fn control(dir: &TempDir) -> ControlLoop<SelfSigned> {
        let mut config = Config::default();
        config.paths.base_dir = Some(dir.path().join("home").display().to_string());
        config.supervisor.interpreter = "sh".to_string();
        config.supervisor.stop_grace_period_secs = 1;
        config.supervisor.port_range_start = 53000;
        let store = ConfigStore::open(config.paths()).unwrap();
        ControlLoop::new(config, store, Arc::new(MemoryDns::new()), SelfSigned)
    }

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[tokio::test]
    async fn test_web_commands() {
        let dir = TempDir::new().unwrap();
        let control = control(&dir);
        let site = dir.path().join("site");

        let created = control
            .dispatch("web.create", &args(&["http://Example.com/", site.to_str().unwrap()]))
            .await;
        assert!(created.result, "{}", created.message);
        assert!(created.message.contains("example.com"));

        let duplicate = control
            .dispatch("web.create", &args(&["example.com", site.to_str().unwrap()]))
            .await;
        assert!(!duplicate.result);

        let listed = control.dispatch("web.list", &[]).await;
        assert_eq!(listed.message, "example.com");

        let renewed = control.dispatch("ssl.renew", &args(&["www.example.com"])).await;
        assert!(renewed.result, "{}", renewed.message);
        assert!(control.store().paths().domain_cert("example.com").is_file());

        let deleted = control.dispatch("web.delete", &args(&["example.com"])).await;
        assert!(deleted.result);
        assert_eq!(control.dispatch("web.list", &[]).await.message, "");
    }

    #[tokio::test]
    async fn test_service_commands() {
        let dir = TempDir::new().unwrap();
        let control = control(&dir);
        let script = dir.path().join("worker.sh");
        std::fs::write(&script, "exec sleep 30\n").unwrap();

        let added = control
            .dispatch("service.start", &args(&[script.to_str().unwrap()]))
            .await;
        assert!(added.result, "{}", added.message);
        assert_eq!(added.message, "Service worker added");
        assert!(control.services().live_pid("0").is_some());

        let stopped = control.dispatch("service.stop", &args(&["worker"])).await;
        assert!(stopped.result);
        assert!(control.services().live_pid("0").is_none());

        let started = control.dispatch("service.start", &args(&["0"])).await;
        assert!(started.result, "{}", started.message);
        assert!(started.message.starts_with("Service 0 started"));

        let listed = control.dispatch("service.list", &[]).await;
        assert_eq!(listed.message, "0 worker running");

        let deleted = control.dispatch("service.delete", &args(&["worker"])).await;
        assert!(deleted.result);
        assert!(control.services().list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_command_and_missing_arguments() {
        let dir = TempDir::new().unwrap();
        let control = control(&dir);

        assert!(!control.dispatch("web.explode", &[]).await.result);
        assert!(!control.dispatch("web.create", &args(&["example.com"])).await.result);
        assert!(!control.dispatch("ssl.renew", &args(&["10.0.0.1"])).await.result);
        assert!(!control.dispatch("service.stop", &args(&["ghost"])).await.result);
    }
}
