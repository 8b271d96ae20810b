/// HTTP client for the argosy server API

use anyhow::Result;
use argosy::{
    persist::ArchivedWorkflow,
    workflow::types::{CronWorkflow, Workflow},
};
use reqwest::{Method, RequestBuilder, Response};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// `{"items": [...]}` list envelope
#[derive(Debug, Deserialize)]
pub struct ItemList<T> {
    pub items: Vec<T>,
}

/// Query for `GET /api/v1/archived-workflows`
#[derive(Debug, Default, Serialize)]
pub struct ArchiveQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phases: Option<String>,
    #[serde(rename = "labelSelector", skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<String>,
    #[serde(rename = "namePrefix", skip_serializing_if = "Option::is_none")]
    pub name_prefix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

pub struct Client {
    base_url: String,
    http: reqwest::Client,
    token: Option<String>,
}

impl Client {
    pub fn new(base_url: &str, token: Option<String>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
            token,
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.http.request(method, format!("{}{}", self.base_url, path));
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T> {
        let response = builder.send().await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn check(response: Response) -> Result<Response> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body: serde_json::Value = response.json().await.unwrap_or_default();
        match body.get("error").and_then(|e| e.as_str()) {
            Some(message) => anyhow::bail!("{}", message),
            None => anyhow::bail!("Server returned error: {}", status),
        }
    }

    pub async fn submit(&self, namespace: &str, workflow: &Workflow) -> Result<Workflow> {
        let path = format!("/api/v1/workflows/{}", namespace);
        self.send(self.request(Method::POST, &path).json(workflow)).await
    }

    pub async fn get_workflow(&self, namespace: &str, name: &str) -> Result<Workflow> {
        let path = format!("/api/v1/workflows/{}/{}", namespace, name);
        self.send(self.request(Method::GET, &path)).await
    }

    pub async fn delete_workflow(&self, namespace: &str, name: &str) -> Result<()> {
        let path = format!("/api/v1/workflows/{}/{}", namespace, name);
        self.send::<serde_json::Value>(self.request(Method::DELETE, &path))
            .await
            .map(|_| ())
    }

    /// `action` is `stop` or `terminate`
    pub async fn shutdown_workflow(&self, namespace: &str, name: &str, action: &str) -> Result<Workflow> {
        let path = format!("/api/v1/workflows/{}/{}/{}", namespace, name, action);
        self.send(self.request(Method::PUT, &path)).await
    }

    pub async fn list_crons(&self, namespace: &str) -> Result<Vec<CronWorkflow>> {
        let path = format!("/api/v1/cron-workflows/{}", namespace);
        let list: ItemList<CronWorkflow> = self.send(self.request(Method::GET, &path)).await?;
        Ok(list.items)
    }

    pub async fn get_cron(&self, namespace: &str, name: &str) -> Result<CronWorkflow> {
        let path = format!("/api/v1/cron-workflows/{}/{}", namespace, name);
        self.send(self.request(Method::GET, &path)).await
    }

    pub async fn create_cron(&self, namespace: &str, cron: &CronWorkflow) -> Result<CronWorkflow> {
        let path = format!("/api/v1/cron-workflows/{}", namespace);
        self.send(self.request(Method::POST, &path).json(cron)).await
    }

    pub async fn delete_cron(&self, namespace: &str, name: &str) -> Result<()> {
        let path = format!("/api/v1/cron-workflows/{}/{}", namespace, name);
        self.send::<serde_json::Value>(self.request(Method::DELETE, &path))
            .await
            .map(|_| ())
    }

    /// `action` is `suspend` or `resume`
    pub async fn set_cron_suspend(&self, namespace: &str, name: &str, action: &str) -> Result<CronWorkflow> {
        let path = format!("/api/v1/cron-workflows/{}/{}/{}", namespace, name, action);
        self.send(self.request(Method::PUT, &path)).await
    }

    pub async fn list_archived(&self, query: &ArchiveQuery) -> Result<Vec<ArchivedWorkflow>> {
        let list: ItemList<ArchivedWorkflow> = self
            .send(self.request(Method::GET, "/api/v1/archived-workflows").query(query))
            .await?;
        Ok(list.items)
    }

    pub async fn get_archived(&self, namespace: &str, uid: &str) -> Result<ArchivedWorkflow> {
        let path = format!("/api/v1/archived-workflows/{}/{}", namespace, uid);
        self.send(self.request(Method::GET, &path)).await
    }

    pub async fn resubmit_archived(&self, namespace: &str, uid: &str) -> Result<Workflow> {
        let path = format!("/api/v1/archived-workflows/{}/{}/resubmit", namespace, uid);
        self.send(self.request(Method::PUT, &path)).await
    }

    pub async fn delete_archived(&self, namespace: &str, uid: &str) -> Result<()> {
        let path = format!("/api/v1/archived-workflows/{}/{}", namespace, uid);
        self.send::<serde_json::Value>(self.request(Method::DELETE, &path))
            .await
            .map(|_| ())
    }
}
