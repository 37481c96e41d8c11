use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use reqwest::{Client, header};
use serde_json::Value;
use url::Url;

use crate::collector::IssueSource;
use crate::models::{Issue, SearchParams, SearchResult};
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub enum Auth {
    Basic { username: String, api_token: String },
    Bearer { token: String },
}

#[derive(Debug, Clone)]
pub struct JiraConfig {
    pub base_url: String,
    pub auth: Auth,
}

impl JiraConfig {
    pub fn new(base_url: impl Into<String>, auth: Auth) -> Result<Self> {
        let base_url = base_url.into();

        // URLの妥当性を検証
        let _ = Url::parse(&base_url)
            .map_err(|_| Error::InvalidConfiguration("Invalid base URL".to_string()))?;

        Ok(Self { base_url, auth })
    }

    pub fn from_env() -> Result<Self> {
        use std::env;

        let base_url = env::var("JIRA_URL").map_err(|_| {
            Error::ConfigurationMissing("JIRA_URL not found in environment".to_string())
        })?;

        let username = env::var("JIRA_USER").map_err(|_| {
            Error::ConfigurationMissing("JIRA_USER not found in environment".to_string())
        })?;

        let api_token = env::var("JIRA_API_TOKEN").map_err(|_| {
            Error::ConfigurationMissing("JIRA_API_TOKEN not found in environment".to_string())
        })?;

        let auth = Auth::Basic {
            username,
            api_token,
        };

        Self::new(base_url, auth)
    }
}

#[derive(Debug, Clone)]
pub struct JiraClient {
    client: Client,
    config: Arc<JiraConfig>,
}

impl JiraClient {
    pub fn new(config: JiraConfig) -> Result<Self> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );
        headers.insert(
            header::ACCEPT,
            header::HeaderValue::from_static("application/json"),
        );

        // 認証ヘッダーを追加
        match &config.auth {
            Auth::Basic { username, api_token } => {
                let auth_value = format!("{}:{}", username, api_token);
                let encoded =
                    base64::engine::general_purpose::STANDARD.encode(auth_value.as_bytes());
                headers.insert(
                    header::AUTHORIZATION,
                    header::HeaderValue::from_str(&format!("Basic {}", encoded)).map_err(|_| {
                        Error::InvalidConfiguration("Invalid auth header".to_string())
                    })?,
                );
            }
            Auth::Bearer { token } => {
                headers.insert(
                    header::AUTHORIZATION,
                    header::HeaderValue::from_str(&format!("Bearer {}", token)).map_err(|_| {
                        Error::InvalidConfiguration("Invalid auth header".to_string())
                    })?,
                );
            }
        }

        let client = Client::builder().default_headers(headers).build()?;

        Ok(Self {
            client,
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &JiraConfig {
        &self.config
    }

    pub async fn get<T>(&self, endpoint: &str) -> Result<T>
    where
        T: serde::de::DeserializeOwned,
    {
        let url = format!("{}{}", self.config.base_url, endpoint);

        let response = self.client.get(&url).send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(Error::ApiError { status, message });
        }

        let data = response.json::<T>().await?;
        Ok(data)
    }

    /// 型付けせずJSONのまま取得（prefetch系エンドポイント用）
    pub async fn get_json(&self, endpoint: &str) -> Result<Value> {
        self.get(endpoint).await
    }

    pub async fn post<T, B>(&self, endpoint: &str, body: &B) -> Result<T>
    where
        T: serde::de::DeserializeOwned,
        B: serde::Serialize,
    {
        let url = format!("{}{}", self.config.base_url, endpoint);

        let response = self.client.post(&url).json(body).send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(Error::ApiError { status, message });
        }

        let data = response.json::<T>().await?;
        Ok(data)
    }

    pub async fn search_issues(&self, jql: &str, params: SearchParams) -> Result<SearchResult> {
        let mut body = serde_json::json!({
            "jql": jql
        });

        // SearchParamsの値をリクエストボディにマージ
        if let Some(start_at) = params.start_at {
            body["startAt"] = start_at.into();
        }
        if let Some(max_results) = params.max_results {
            body["maxResults"] = max_results.into();
        }
        if let Some(fields) = params.fields {
            body["fields"] = fields.into();
        }
        if let Some(expand) = params.expand {
            body["expand"] = expand.into();
        }

        self.post("/rest/api/3/search", &body).await
    }
}

/// JQL検索をページングしながら課題を供給するソース
///
/// changelog復元に必要な `expand=changelog` を常に付与する。
pub struct SearchSource {
    client: JiraClient,
    jql: String,
    page_size: u32,
    start_at: u32,
}

impl SearchSource {
    pub fn new(client: JiraClient, jql: impl Into<String>) -> Self {
        Self {
            client,
            jql: jql.into(),
            page_size: 50,
            start_at: 0,
        }
    }

    pub fn page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }
}

#[async_trait]
impl IssueSource for SearchSource {
    async fn next_batch(&mut self) -> Result<Vec<Issue>> {
        let params = SearchParams::new()
            .start_at(self.start_at)
            .max_results(self.page_size)
            .expand(vec!["changelog".to_string()]);

        let result = self.client.search_issues(&self.jql, params).await?;
        self.start_at += result.issues.len() as u32;
        Ok(result.issues)
    }
}
