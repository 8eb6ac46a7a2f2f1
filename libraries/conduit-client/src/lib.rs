//! Signed HTTP client for the broker protocol, shared by the worker loop,
//! the operator CLI, and the integration tests. Every call signs the request
//! envelope with the configured key and surfaces the broker's `{error}` body
//! as the error message.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use conduit_structs::{
    ApiError, CheckFileRequest, DeleteMessageRequest, DeleteMessageResponse,
    DeploymentStats, DeploymentStatsRequest, DeploymentStatsResponse, GetAssetRequest,
    GetMessageRequest, GetMessageResponse, PutMessageRequest, PutMessageResponse,
    RegisterRequest, RegisterResponse, ResponseRequest, Signed, SimpleRequest, SimpleResponse,
    SystemStatsResponse, UploadFileRequest,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::io::ReaderStream;

#[derive(Clone, Debug, Default)]
pub struct ClientConfig {
    /// Broker address, `host:port`.
    pub host: String,
    pub key_name: String,
    pub secret: String,
    /// The mailbox polled by `get_message`; empty for admin-only clients.
    pub mailbox: String,
    /// Optional outbound proxy URL for every request.
    pub proxy: Option<String>,
    /// Log the JSON of each outgoing request.
    pub show_requests: bool,
}

pub struct Client {
    config: ClientConfig,
    http: reqwest::Client,
}

impl Client {
    pub fn new(config: ClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(proxy) = &config.proxy {
            builder = builder.proxy(
                reqwest::Proxy::all(proxy).with_context(|| format!("bad proxy url {proxy}"))?,
            );
        }
        let http = builder.build().context("build http client")?;
        Ok(Self { config, http })
    }

    pub fn mailbox(&self) -> &str {
        &self.config.mailbox
    }

    /// Long-poll the configured mailbox. The call may legitimately hang for
    /// many minutes; no client-side timeout is applied.
    pub async fn get_message(&self) -> anyhow::Result<GetMessageResponse> {
        let req = GetMessageRequest {
            mailbox: self.config.mailbox.clone(),
            ..Default::default()
        };
        self.post("get", req).await
    }

    pub async fn put_message(
        &self,
        mailboxes: &[String],
        pattern: &str,
        body: &str,
        deployment_name: &str,
        asset: &str,
    ) -> anyhow::Result<PutMessageResponse> {
        let req = PutMessageRequest {
            mailboxes: mailboxes.to_vec(),
            pattern: pattern.to_string(),
            body: body.to_string(),
            deployment_name: deployment_name.to_string(),
            asset: asset.to_string(),
            ..Default::default()
        };
        self.post("put", req).await
    }

    pub async fn delete(&self, message: &str) -> anyhow::Result<DeleteMessageResponse> {
        let req = DeleteMessageRequest {
            message: message.to_string(),
            ..Default::default()
        };
        self.post("delete", req).await
    }

    pub async fn respond(
        &self,
        message: &str,
        response: &str,
        is_error: bool,
    ) -> anyhow::Result<SimpleResponse> {
        let req = ResponseRequest {
            message: message.to_string(),
            response: response.to_string(),
            error: is_error,
            ..Default::default()
        };
        self.post("deploy/respond", req).await
    }

    pub async fn list_deployments(
        &self,
        name_search: &str,
        key_name_search: &str,
        count: i64,
        get_responses: bool,
    ) -> anyhow::Result<DeploymentStatsResponse> {
        let req = DeploymentStatsRequest {
            name_search: name_search.to_string(),
            key_name_search: key_name_search.to_string(),
            count,
            get_responses,
            ..Default::default()
        };
        self.post("deploy/list", req).await
    }

    /// Stats and responses for one deployment.
    pub async fn deployment_stats(&self, deployment_id: &str) -> anyhow::Result<DeploymentStats> {
        let req = DeploymentStatsRequest {
            deployment_id: deployment_id.to_string(),
            get_responses: true,
            ..Default::default()
        };
        let mut resp: DeploymentStatsResponse = self.post("deploy/list", req).await?;
        match resp.deployments.pop() {
            Some(stats) => Ok(stats),
            None => bail!("deployment {deployment_id} not found"),
        }
    }

    /// Poll a deployment's stats roughly once a second for as long as
    /// `keep_going` asks for more, returning the final snapshot.
    pub async fn poll_deployment<F>(
        &self,
        deployment_id: &str,
        mut keep_going: F,
    ) -> anyhow::Result<DeploymentStats>
    where
        F: FnMut(&DeploymentStats) -> bool,
    {
        loop {
            let stats = self.deployment_stats(deployment_id).await?;
            if !keep_going(&stats) {
                return Ok(stats);
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    pub async fn register(&self, mailbox: &str) -> anyhow::Result<RegisterResponse> {
        let req = RegisterRequest {
            mailbox: mailbox.to_string(),
            ..Default::default()
        };
        self.post("register", req).await
    }

    pub async fn deregister(&self, mailbox: &str) -> anyhow::Result<SimpleResponse> {
        let req = RegisterRequest {
            mailbox: mailbox.to_string(),
            ..Default::default()
        };
        self.post("deregister", req).await
    }

    pub async fn system_stats(&self) -> anyhow::Result<SystemStatsResponse> {
        self.post("stats", SimpleRequest::default()).await
    }

    pub async fn client_status(&self) -> anyhow::Result<conduit_structs::ClientStatusResponse> {
        self.post("stats/clients", SimpleRequest::default()).await
    }

    pub async fn check_file(&self, md5: &str) -> anyhow::Result<bool> {
        let req = CheckFileRequest {
            md5: md5.to_string(),
            ..Default::default()
        };
        let resp: SimpleResponse = self.post("checkfile", req).await?;
        Ok(resp.success)
    }

    /// Upload a file as a content-addressed asset, returning its MD5. Skips
    /// the transfer when the broker already holds the blob.
    pub async fn upload_asset(&self, path: &Path) -> anyhow::Result<String> {
        let hash_path = path.to_path_buf();
        let md5 = tokio::task::spawn_blocking(move || {
            conduit_crypt::content::file_md5(&hash_path)
        })
        .await?
        .with_context(|| format!("hash {}", path.display()))?;

        if self.check_file(&md5).await? {
            tracing::debug!(md5 = %md5, "asset already on broker");
            return Ok(md5);
        }

        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut req = UploadFileRequest {
            filename: filename.clone(),
            md5: md5.clone(),
            ..Default::default()
        };
        req.sign(&self.config.key_name, &self.config.secret);

        let file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("open {}", path.display()))?;
        let part = reqwest::multipart::Part::stream(reqwest::Body::wrap_stream(
            ReaderStream::new(file),
        ))
        .file_name(filename);
        let form = reqwest::multipart::Form::new()
            .text("data", serde_json::to_string(&req)?)
            .part("file", part);

        let resp = self
            .http
            .post(self.url("upload"))
            .multipart(form)
            .send()
            .await?;
        if !resp.status().is_success() {
            bail!("{}", error_body(resp).await);
        }
        Ok(md5)
    }

    /// Download an asset blob into `dir/<md5>`, verifying the content hash.
    pub async fn download_asset(&self, md5: &str, dir: &Path) -> anyhow::Result<PathBuf> {
        let mut req = GetAssetRequest {
            md5: md5.to_string(),
            ..Default::default()
        };
        req.sign(&self.config.key_name, &self.config.secret);

        let resp = self.http.post(self.url("asset")).json(&req).send().await?;
        if !resp.status().is_success() {
            bail!("{}", error_body(resp).await);
        }
        let bytes = resp.bytes().await?;
        if conduit_crypt::content::md5_hex(&bytes) != md5 {
            bail!("downloaded asset does not match {md5}");
        }
        let path = dir.join(md5);
        tokio::fs::write(&path, &bytes)
            .await
            .with_context(|| format!("write {}", path.display()))?;
        Ok(path)
    }

    fn url(&self, endpoint: &str) -> String {
        format!("http://{}/{}", self.config.host, endpoint)
    }

    async fn post<Req, Resp>(&self, endpoint: &str, mut req: Req) -> anyhow::Result<Resp>
    where
        Req: Signed + Serialize,
        Resp: DeserializeOwned,
    {
        req.sign(&self.config.key_name, &self.config.secret);
        if self.config.show_requests {
            tracing::debug!(endpoint, body = %serde_json::to_string(&req).unwrap_or_default(),
                "sending request");
        }
        let resp = self
            .http
            .post(self.url(endpoint))
            .json(&req)
            .send()
            .await
            .with_context(|| format!("post /{endpoint}"))?;
        if !resp.status().is_success() {
            bail!("{}", error_body(resp).await);
        }
        Ok(resp.json().await.context("decode response")?)
    }
}

async fn error_body(resp: reqwest::Response) -> String {
    let status = resp.status();
    match resp.json::<ApiError>().await {
        Ok(body) if !body.error.is_empty() => body.error,
        _ => format!("broker returned {status}"),
    }
}
