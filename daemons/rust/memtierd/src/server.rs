// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! The event transport: line-delimited JSON over a unix socket. The
//! runtime shim connects, writes one request per line, and reads one
//! response per line. Requests on a connection are handled in arrival
//! order; the policy lock serializes decisions across connections.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::spawn;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use memtier::cache::{ContainerSpec, PodSpec};
use memtier::resmgr::{ContainerCreateUpdate, ContainerUpdate};
use memtier::{ClassMap, ResourceManager, KATA_CLASS};

use crate::control;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum EventRequest {
    RunPodSandbox {
        pod: PodSpec,
    },
    StopPodSandbox {
        id: String,
    },
    RemovePodSandbox {
        id: String,
    },
    CreateContainer {
        container: ContainerSpec,
    },
    StartContainer {
        id: String,
    },
    UpdateContainer {
        id: String,
    },
    StopContainer {
        id: String,
    },
    RemoveContainer {
        id: String,
    },
    Synchronize {
        #[serde(default)]
        pods: Vec<PodSpec>,
        #[serde(default)]
        containers: Vec<ContainerSpec>,
    },
    Shutdown,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct EventResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub create: Option<ContainerCreateUpdate>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub updates: Vec<ContainerUpdate>,
}

impl EventResponse {
    fn error(e: impl std::fmt::Display) -> Self {
        Self {
            error: Some(format!("{e:#}")),
            ..Default::default()
        }
    }
}

pub struct Server {
    mgr: Arc<ResourceManager>,
    classes: ClassMap,
    enforce_kata: bool,
}

impl Server {
    pub fn new(mgr: Arc<ResourceManager>, classes: ClassMap, enforce_kata: bool) -> Self {
        Self {
            mgr,
            classes,
            enforce_kata,
        }
    }

    /// Accept and serve shim connections until shutdown is flagged.
    pub fn serve(self: Arc<Self>, path: &Path, shutdown: Arc<AtomicBool>) -> Result<()> {
        if path.exists() {
            std::fs::remove_file(path)
                .with_context(|| format!("failed to remove stale socket {path:?}"))?;
        }
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create socket directory {dir:?}"))?;
        }

        let listener =
            UnixListener::bind(path).with_context(|| format!("failed to listen on {path:?}"))?;
        listener.set_nonblocking(true)?;
        info!("listening on {path:?}");

        while !shutdown.load(Ordering::Relaxed) {
            match listener.accept() {
                Ok((stream, _)) => {
                    let server = self.clone();
                    let shutdown = shutdown.clone();
                    spawn(move || {
                        if let Err(e) = server.handle_connection(stream, shutdown) {
                            warn!("connection failed: {e:#}");
                        }
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(100));
                }
                Err(e) => return Err(e).context("accept failed"),
            }
        }

        info!("server shutting down");
        Ok(())
    }

    fn handle_connection(
        &self,
        stream: UnixStream,
        shutdown: Arc<AtomicBool>,
    ) -> Result<()> {
        stream.set_nonblocking(false)?;
        let mut writer = stream.try_clone()?;
        let reader = BufReader::new(stream);

        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            debug!("request: {line}");

            let response = match serde_json::from_str::<EventRequest>(&line) {
                Ok(request) => self.dispatch(request, &shutdown),
                Err(e) => EventResponse::error(format!("bad request: {e}")),
            };

            let mut data = serde_json::to_vec(&response)?;
            data.push(b'\n');
            writer.write_all(&data)?;
        }

        Ok(())
    }

    fn dispatch(&self, request: EventRequest, shutdown: &AtomicBool) -> EventResponse {
        match request {
            EventRequest::RunPodSandbox { pod } => {
                self.mgr.run_pod_sandbox(pod);
                EventResponse::default()
            }
            EventRequest::StopPodSandbox { id } => {
                self.mgr.stop_pod_sandbox(&id);
                EventResponse::default()
            }
            EventRequest::RemovePodSandbox { id } => {
                self.mgr.remove_pod_sandbox(&id);
                EventResponse::default()
            }
            EventRequest::CreateContainer { container } => {
                match self.mgr.create_container(container) {
                    Ok(response) => {
                        self.enforce(&response.updates);
                        EventResponse {
                            create: Some(response.create),
                            updates: response.updates,
                            ..Default::default()
                        }
                    }
                    Err(e) => EventResponse::error(e),
                }
            }
            EventRequest::StartContainer { id } => {
                self.mgr.start_container(&id);
                EventResponse::default()
            }
            EventRequest::UpdateContainer { id } => {
                let updates = self.mgr.update_container(&id);
                self.enforce(&updates);
                EventResponse {
                    updates,
                    ..Default::default()
                }
            }
            EventRequest::StopContainer { id } => match self.mgr.stop_container(&id) {
                Ok(updates) => {
                    self.enforce(&updates);
                    EventResponse {
                        updates,
                        ..Default::default()
                    }
                }
                Err(e) => EventResponse::error(e),
            },
            EventRequest::RemoveContainer { id } => match self.mgr.remove_container(&id) {
                Ok(()) => EventResponse::default(),
                Err(e) => EventResponse::error(e),
            },
            EventRequest::Synchronize { pods, containers } => {
                match self.mgr.synchronize(pods, containers) {
                    Ok(updates) => {
                        self.enforce(&updates);
                        EventResponse {
                            updates,
                            ..Default::default()
                        }
                    }
                    Err(e) => EventResponse::error(e),
                }
            }
            EventRequest::Shutdown => {
                self.mgr.shutdown();
                shutdown.store(true, Ordering::Relaxed);
                EventResponse::default()
            }
        }
    }

    /// Push updates of Kata-classed containers straight into their
    /// sandbox cgroups; the runtime applies everything else from the
    /// response.
    fn enforce(&self, updates: &[ContainerUpdate]) {
        if !self.enforce_kata {
            return;
        }

        for update in updates {
            let target = self.mgr.with_policy(|_, cache| {
                let container = cache.lookup_container(&update.container_id)?;
                let pod = cache.pod_of(container)?;
                let class = self.classes.match_handler(&pod.runtime_handler)?;
                (class == KATA_CLASS).then(|| pod.id.clone())
            });

            if let Some(pod_id) = target {
                if let Err(e) = control::apply_kata(&pod_id, &update.resources) {
                    warn!(
                        "kata enforcement failed for {}: {e:#}",
                        update.container_id
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_decoding() {
        let line = r#"{"op": "run_pod_sandbox", "pod": {"id": "p0", "name": "p0"}}"#;
        match serde_json::from_str::<EventRequest>(line).unwrap() {
            EventRequest::RunPodSandbox { pod } => assert_eq!(pod.id, "p0"),
            other => panic!("decoded {other:?}"),
        }

        let line = r#"{"op": "create_container",
                       "container": {"id": "c0", "pod_id": "p0", "name": "app",
                                     "resources": {"cpu_request_milli": 500,
                                                   "cpu_limit_milli": 500,
                                                   "mem_request": 1073741824,
                                                   "mem_limit": 1073741824}}}"#;
        match serde_json::from_str::<EventRequest>(line).unwrap() {
            EventRequest::CreateContainer { container } => {
                assert_eq!(container.resources.cpu_limit_milli, 500);
            }
            other => panic!("decoded {other:?}"),
        }

        let line = r#"{"op": "shutdown"}"#;
        assert!(matches!(
            serde_json::from_str::<EventRequest>(line).unwrap(),
            EventRequest::Shutdown
        ));

        assert!(serde_json::from_str::<EventRequest>(r#"{"op": "nope"}"#).is_err());
    }

    #[test]
    fn response_encoding() {
        let response = EventResponse::default();
        assert_eq!(serde_json::to_string(&response).unwrap(), "{}");

        let response = EventResponse::error("insufficient resources");
        assert!(serde_json::to_string(&response)
            .unwrap()
            .contains("insufficient resources"));
    }
}
