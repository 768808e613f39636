use sealedballot::{BackupError, RemoteBackup};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Serialize, Deserialize, Debug, Clone)]
struct PutResp {
    id: String,
}

/// Key backup replica behind an HTTP object store
///
/// `POST {base}/objects` stores a body and answers `{"id": ...}`,
/// `GET {base}/objects/{id}` returns it.
pub struct HttpBackup {
    base_uri: String,
    client: reqwest::blocking::Client,
}

impl HttpBackup {
    pub fn new(base_uri: &str, timeout: Duration) -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::blocking::Client::new());
        HttpBackup {
            base_uri: base_uri.trim_end_matches('/').to_owned(),
            client,
        }
    }
}

fn unavailable(e: reqwest::Error) -> BackupError {
    BackupError::Unavailable(e.to_string())
}

impl RemoteBackup for HttpBackup {
    fn put(&self, bytes: &[u8]) -> Result<String, BackupError> {
        let full_uri = format!("{}/objects", self.base_uri);
        let res: PutResp = self
            .client
            .post(&full_uri)
            .body(bytes.to_vec())
            .send()
            .and_then(|res| res.error_for_status())
            .and_then(|res| res.json())
            .map_err(unavailable)?;
        Ok(res.id)
    }

    fn get(&self, id: &str) -> Result<Vec<u8>, BackupError> {
        let full_uri = format!("{}/objects/{}", self.base_uri, id);
        let res = self.client.get(&full_uri).send().map_err(unavailable)?;
        if res.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(BackupError::NotFound(id.to_string()));
        }
        let bytes = res
            .error_for_status()
            .and_then(|res| res.bytes())
            .map_err(unavailable)?;
        Ok(bytes.to_vec())
    }
}
