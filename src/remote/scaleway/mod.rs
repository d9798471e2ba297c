//! Scaleway implementation of the remote block storage boundary.
//!
//! Volumes and snapshots are managed through the Block Storage API, and
//! attachments through the Instance API's per-volume server actions.
//! Identifiers handed out by this client carry their zone as
//! `<zone>/<uuid>` so that every later call reaches the zone the resource
//! was created in; a bare identifier is taken to live in the client's zone.

use std::time::Duration;

use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;

use super::{
    ChargeModel, DiskRequest, RemoteClient, RemoteDisk, RemoteError, RemoteFuture, RemoteSnapshot,
};
use wire::{
    AttachVolumeBody, CreateSnapshotBody, CreateVolumeBody, DetachVolumeBody, FromEmpty,
    FromSnapshot, ListVolumesResponse, Snapshot, UpdateVolumeBody, Volume,
};

mod wire;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const BLOCK_API_PATH: &str = "block/v1alpha1";
const INSTANCE_API_PATH: &str = "instance/v1";
const BLOCK_VOLUME_TYPE: &str = "sbs_volume";

/// Remote client backed by the Scaleway APIs.
#[derive(Clone)]
pub struct ScalewayClient {
    http: reqwest::Client,
    api_url: String,
    secret_key: String,
    project_id: String,
    zone: String,
}

impl ScalewayClient {
    /// Creates a client bound to one project. `zone` is used for
    /// identifiers that do not name their own zone.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::Transport`] when the HTTP client cannot be built.
    pub fn new(
        api_url: impl Into<String>,
        secret_key: impl Into<String>,
        project_id: impl Into<String>,
        zone: impl Into<String>,
    ) -> Result<Self, RemoteError> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|err| RemoteError::Transport {
                operation: String::from("client setup"),
                message: err.to_string(),
            })?;
        Ok(Self {
            http,
            api_url: api_url.into().trim_end_matches('/').to_owned(),
            secret_key: secret_key.into(),
            project_id: project_id.into(),
            zone: zone.into(),
        })
    }

    /// Splits `<zone>/<uuid>` into its parts.
    fn split_id<'a>(&'a self, id: &'a str) -> (&'a str, &'a str) {
        id.split_once('/').unwrap_or((self.zone.as_str(), id))
    }

    fn block_url(&self, zone: &str, resource: &str) -> String {
        format!("{}/{BLOCK_API_PATH}/zones/{zone}/{resource}", self.api_url)
    }

    fn server_action_url(&self, zone: &str, node_id: &str, action: &str) -> String {
        format!(
            "{}/{INSTANCE_API_PATH}/zones/{zone}/servers/{node_id}/{action}",
            self.api_url
        )
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.http
            .request(method, url)
            .header("X-Auth-Token", &self.secret_key)
    }

    /// Sends a request and decodes the body; `404` maps to `None`.
    async fn send_json<T: DeserializeOwned>(
        &self,
        operation: &str,
        builder: RequestBuilder,
    ) -> Result<Option<T>, RemoteError> {
        let response = builder.send().await.map_err(|err| RemoteError::Transport {
            operation: operation.to_owned(),
            message: err.to_string(),
        })?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|err| RemoteError::Transport {
                operation: operation.to_owned(),
                message: err.to_string(),
            })?;

        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(RemoteError::Rejected {
                operation: operation.to_owned(),
                message: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        if body.is_empty() {
            return serde_json::from_slice(b"null").map_err(|err| decode_error(operation, &err));
        }
        serde_json::from_slice(&body)
            .map(Some)
            .map_err(|err| decode_error(operation, &err))
    }

    /// Sends a request whose response body is irrelevant; `404` is accepted.
    async fn send_unit(&self, operation: &str, builder: RequestBuilder) -> Result<(), RemoteError> {
        self.send_json::<serde_json::Value>(operation, builder)
            .await
            .map(|_| ())
    }

    async fn find_volume_by_name(
        &self,
        zone: &str,
        name: &str,
    ) -> Result<Option<String>, RemoteError> {
        let builder = self
            .request(Method::GET, &self.block_url(zone, "volumes"))
            .query(&[("name", name), ("project_id", self.project_id.as_str())]);
        let listed: Option<ListVolumesResponse> = self.send_json("list volumes", builder).await?;
        Ok(listed.and_then(|list| {
            list.volumes
                .into_iter()
                .find(|volume| volume.name == name)
                .map(|volume| zoned_id(zone, &volume.id))
        }))
    }
}

fn zoned_id(zone: &str, id: &str) -> String {
    format!("{zone}/{id}")
}

fn decode_error(operation: &str, err: &serde_json::Error) -> RemoteError {
    RemoteError::Transport {
        operation: operation.to_owned(),
        message: format!("invalid response: {err}"),
    }
}

impl RemoteClient for ScalewayClient {
    fn create_disk<'a>(&'a self, request: &'a DiskRequest) -> RemoteFuture<'a, String> {
        Box::pin(async move {
            if matches!(request.charge, ChargeModel::PrePaid { .. }) {
                return Err(RemoteError::Unsupported {
                    feature: String::from("prepaid disks"),
                });
            }
            let zone = request.zone.as_str();
            if let Some(existing) = self.find_volume_by_name(zone, &request.client_token).await? {
                debug!(volume_id = %existing, token = %request.client_token, "reusing volume created by an earlier attempt");
                return Ok(existing);
            }

            let size = wire::gib_to_api_bytes(request.size_gib);
            let body = CreateVolumeBody {
                name: request.client_token.clone(),
                project_id: self.project_id.clone(),
                perf_iops: wire::perf_iops(&request.disk_type),
                from_empty: request
                    .snapshot_id
                    .is_none()
                    .then_some(FromEmpty { size }),
                from_snapshot: request.snapshot_id.as_deref().map(|snapshot_id| FromSnapshot {
                    snapshot_id: self.split_id(snapshot_id).1.to_owned(),
                    size,
                }),
                tags: vec![String::from("volplane"), format!("volplane-name={}", request.name)],
            };
            let builder = self
                .request(Method::POST, &self.block_url(zone, "volumes"))
                .json(&body);
            let created: Option<Volume> = self.send_json("create volume", builder).await?;
            created
                .map(|volume| zoned_id(zone, &volume.id))
                .ok_or_else(|| RemoteError::Rejected {
                    operation: String::from("create volume"),
                    message: String::from("provider returned no volume"),
                })
        })
    }

    fn describe_disks<'a>(&'a self, ids: &'a [String]) -> RemoteFuture<'a, Vec<RemoteDisk>> {
        Box::pin(async move {
            let mut disks = Vec::with_capacity(ids.len());
            for id in ids {
                let (zone, uuid) = self.split_id(id);
                let url = self.block_url(zone, &format!("volumes/{uuid}"));
                let volume: Option<Volume> = self
                    .send_json("describe volume", self.request(Method::GET, &url))
                    .await?;
                disks.extend(volume.map(|found| found.into_remote(zone)));
            }
            Ok(disks)
        })
    }

    fn delete_disk<'a>(&'a self, id: &'a str) -> RemoteFuture<'a, ()> {
        Box::pin(async move {
            let (zone, uuid) = self.split_id(id);
            let url = self.block_url(zone, &format!("volumes/{uuid}"));
            self.send_unit("delete volume", self.request(Method::DELETE, &url))
                .await
        })
    }

    fn attach_disk<'a>(&'a self, id: &'a str, node_id: &'a str) -> RemoteFuture<'a, ()> {
        Box::pin(async move {
            let (zone, uuid) = self.split_id(id);
            let body = AttachVolumeBody {
                volume_id: uuid.to_owned(),
                volume_type: String::from(BLOCK_VOLUME_TYPE),
            };
            let url = self.server_action_url(zone, node_id, "attach-volume");
            let accepted: Option<serde_json::Value> = self
                .send_json("attach volume", self.request(Method::POST, &url).json(&body))
                .await?;
            accepted.map(|_| ()).ok_or_else(|| RemoteError::Rejected {
                operation: String::from("attach volume"),
                message: format!("server {node_id} not found in {zone}"),
            })
        })
    }

    fn detach_disk<'a>(&'a self, id: &'a str, node_id: &'a str) -> RemoteFuture<'a, ()> {
        Box::pin(async move {
            let (zone, uuid) = self.split_id(id);
            let body = DetachVolumeBody {
                volume_id: uuid.to_owned(),
            };
            let url = self.server_action_url(zone, node_id, "detach-volume");
            self.send_unit("detach volume", self.request(Method::POST, &url).json(&body))
                .await
        })
    }

    fn resize_disk<'a>(&'a self, id: &'a str, size_gib: u64) -> RemoteFuture<'a, ()> {
        Box::pin(async move {
            let (zone, uuid) = self.split_id(id);
            let url = self.block_url(zone, &format!("volumes/{uuid}"));
            let body = UpdateVolumeBody {
                size: wire::gib_to_api_bytes(size_gib),
            };
            self.send_unit("resize volume", self.request(Method::PATCH, &url).json(&body))
                .await
        })
    }

    fn create_snapshot<'a>(
        &'a self,
        source_id: &'a str,
        name: &'a str,
    ) -> RemoteFuture<'a, String> {
        Box::pin(async move {
            let (zone, uuid) = self.split_id(source_id);
            let body = CreateSnapshotBody {
                volume_id: uuid.to_owned(),
                name: name.to_owned(),
                project_id: self.project_id.clone(),
            };
            let builder = self
                .request(Method::POST, &self.block_url(zone, "snapshots"))
                .json(&body);
            let created: Option<Snapshot> = self.send_json("create snapshot", builder).await?;
            created
                .map(|snapshot| zoned_id(zone, &snapshot.id))
                .ok_or_else(|| RemoteError::Rejected {
                    operation: String::from("create snapshot"),
                    message: format!("source volume {source_id} not found"),
                })
        })
    }

    fn describe_snapshots<'a>(
        &'a self,
        ids: &'a [String],
    ) -> RemoteFuture<'a, Vec<RemoteSnapshot>> {
        Box::pin(async move {
            let mut snapshots = Vec::with_capacity(ids.len());
            for id in ids {
                let (zone, uuid) = self.split_id(id);
                let url = self.block_url(zone, &format!("snapshots/{uuid}"));
                let snapshot: Option<Snapshot> = self
                    .send_json("describe snapshot", self.request(Method::GET, &url))
                    .await?;
                snapshots.extend(snapshot.map(|found| found.into_remote(zone)));
            }
            Ok(snapshots)
        })
    }

    fn delete_snapshot<'a>(&'a self, id: &'a str) -> RemoteFuture<'a, ()> {
        Box::pin(async move {
            let (zone, uuid) = self.split_id(id);
            let url = self.block_url(zone, &format!("snapshots/{uuid}"));
            self.send_unit("delete snapshot", self.request(Method::DELETE, &url))
                .await
        })
    }

    fn bind_snapshot_policy<'a>(
        &'a self,
        _policy_id: &'a str,
        _disk_id: &'a str,
    ) -> RemoteFuture<'a, ()> {
        Box::pin(async move {
            Err(RemoteError::Unsupported {
                feature: String::from("automatic snapshot policies"),
            })
        })
    }
}

#[cfg(test)]
mod tests;
