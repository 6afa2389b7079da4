//! JSON request/response framing of the CPI protocol.
//!
//! ```text
//! stdin  {"method": "attach_disk", "arguments": ["vm-..", "disk-.."], "context": {..}}
//! stdout {"result": .., "error": null, "log": ""}
//! ```
//!
//! Every failure, including malformed arguments, is reported inside the
//! response; only a request that is not JSON at all fails [`handle_bytes`]'s
//! caller.

use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{error, info};

use crate::config::Config;
use crate::cpi::{self, Cpi};
use crate::driver::{Retrier, Runner};
use crate::vm::Networks;

/// Disk hints are returned from `attach_disk` starting with this API version.
const ATTACH_DISK_HINT_API_VERSION: u32 = 2;
const DEFAULT_STEMCELL_API_VERSION: u32 = 1;

pub const CLOUD_ERROR: &str = "Bosh::Clouds::CloudError";
pub const NOT_IMPLEMENTED: &str = "Bosh::Clouds::NotImplemented";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Request {
    pub method: String,
    #[serde(default)]
    pub arguments: Vec<Value>,
    #[serde(default)]
    pub context: Value,
    #[serde(default)]
    pub api_version: Option<u32>,
}

impl Request {
    /// Stemcell API version of the VM this request concerns.
    pub fn stemcell_api_version(&self) -> u32 {
        self.context
            .pointer("/vm/stemcell/api_version")
            .and_then(Value::as_u64)
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(DEFAULT_STEMCELL_API_VERSION)
    }

    fn api_version(&self) -> u32 {
        self.api_version.unwrap_or(1)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseError {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    pub ok_to_retry: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    pub result: Value,
    pub error: Option<ResponseError>,
    pub log: String,
}

impl Response {
    fn ok(result: Value) -> Self {
        Self {
            result,
            error: None,
            log: String::new(),
        }
    }

    fn err(kind: &str, err: &anyhow::Error) -> Self {
        Self {
            result: Value::Null,
            error: Some(ResponseError {
                kind: kind.to_string(),
                message: format!("{err:#}"),
                ok_to_retry: false,
            }),
            log: String::new(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Must call implemented method: '{0}'")]
struct NotImplemented(String);

/// Builds a [`Cpi`] for each request against one configured installation.
pub struct Dispatcher {
    config: Config,
    runner: Arc<dyn Runner>,
    retrier: Retrier,
    import_retrier: Retrier,
}

impl Dispatcher {
    pub fn new(config: Config, runner: Arc<dyn Runner>) -> Self {
        Self {
            config,
            runner,
            retrier: Retrier::default(),
            import_retrier: cpi::import_retrier(),
        }
    }

    pub fn with_retriers(mut self, retrier: Retrier, import_retrier: Retrier) -> Self {
        self.retrier = retrier;
        self.import_retrier = import_retrier;
        self
    }

    /// Parse one request and serve it; the returned bytes are the response.
    pub async fn handle_bytes(&self, input: &[u8]) -> Result<Vec<u8>> {
        let response = match serde_json::from_slice::<Request>(input) {
            Ok(req) => self.handle(req).await,
            Err(err) => Response::err(CLOUD_ERROR, &anyhow!(err).context("Unmarshalling request")),
        };
        serde_json::to_vec(&response).context("Marshalling response")
    }

    pub async fn handle(&self, req: Request) -> Response {
        info!(method = %req.method, args = req.arguments.len(), "Handling request");

        match self.call(&req).await {
            Ok(result) => Response::ok(result),
            Err(err) => {
                error!(method = %req.method, error = ?err, "Request failed");
                let kind = if err.downcast_ref::<NotImplemented>().is_some() {
                    NOT_IMPLEMENTED
                } else {
                    CLOUD_ERROR
                };
                Response::err(kind, &err)
            }
        }
    }

    async fn call(&self, req: &Request) -> Result<Value> {
        let cpi = Cpi::with_retriers(
            &self.config,
            self.runner.clone(),
            req.stemcell_api_version(),
            self.retrier,
            self.import_retrier,
        )?;
        let args = Args(&req.arguments);

        Ok(match req.method.as_str() {
            "info" => serde_json::to_value(cpi.info())?,

            "create_stemcell" => json!(cpi.create_stemcell(&args.get::<String>(0, "image path")?).await?),
            "delete_stemcell" => {
                cpi.delete_stemcell(&args.get::<String>(0, "stemcell CID")?).await?;
                Value::Null
            }

            "create_vm" => {
                let vm_id = cpi
                    .create_vm(
                        &args.get::<String>(0, "agent ID")?,
                        &args.get::<String>(1, "stemcell CID")?,
                        args.opt(2, "cloud properties")?,
                        args.opt::<Option<Networks>>(3, "networks")?.unwrap_or_default(),
                        args.opt(5, "env")?,
                    )
                    .await?;
                json!(vm_id)
            }
            "delete_vm" => {
                cpi.delete_vm(&args.get::<String>(0, "VM CID")?).await?;
                Value::Null
            }
            "has_vm" => json!(cpi.has_vm(&args.get::<String>(0, "VM CID")?).await?),
            "reboot_vm" => {
                cpi.reboot_vm(&args.get::<String>(0, "VM CID")?).await?;
                Value::Null
            }
            "set_vm_metadata" => {
                let metadata: Value = args.opt(1, "metadata")?;
                cpi.set_vm_metadata(&args.get::<String>(0, "VM CID")?, &metadata)
                    .await?;
                Value::Null
            }
            "calculate_vm_cloud_properties" => {
                let reqs: VmResources = args.get(0, "VM resources")?;
                serde_json::to_value(cpi.calculate_vm_cloud_properties(
                    reqs.ram,
                    reqs.cpu,
                    reqs.ephemeral_disk_size,
                ))?
            }

            "create_disk" => json!(cpi.create_disk(args.get::<u64>(0, "disk size")?).await?),
            "delete_disk" => {
                cpi.delete_disk(&args.get::<String>(0, "disk CID")?).await?;
                Value::Null
            }
            "has_disk" => json!(cpi.has_disk(&args.get::<String>(0, "disk CID")?).await?),
            "attach_disk" => {
                let hint = cpi
                    .attach_disk(
                        &args.get::<String>(0, "VM CID")?,
                        &args.get::<String>(1, "disk CID")?,
                    )
                    .await?;
                if req.api_version() >= ATTACH_DISK_HINT_API_VERSION {
                    hint
                } else {
                    Value::Null
                }
            }
            "detach_disk" => {
                cpi.detach_disk(
                    &args.get::<String>(0, "VM CID")?,
                    &args.get::<String>(1, "disk CID")?,
                )
                .await?;
                Value::Null
            }
            "get_disks" => json!(cpi.get_disks(&args.get::<String>(0, "VM CID")?).await?),

            other => return Err(NotImplemented(other.to_string()).into()),
        })
    }
}

#[derive(Debug, Deserialize)]
struct VmResources {
    #[serde(default)]
    ram: u64,
    #[serde(default)]
    cpu: u64,
    #[serde(default)]
    ephemeral_disk_size: u64,
}

struct Args<'a>(&'a [Value]);

impl Args<'_> {
    fn get<T: DeserializeOwned>(&self, idx: usize, name: &str) -> Result<T> {
        let value = self
            .0
            .get(idx)
            .with_context(|| format!("Missing argument {idx} ({name})"))?;
        serde_json::from_value(value.clone())
            .with_context(|| format!("Unmarshalling argument {idx} ({name})"))
    }

    /// Absent trailing arguments read as `null`.
    fn opt<T: DeserializeOwned>(&self, idx: usize, name: &str) -> Result<T> {
        let value = self.0.get(idx).cloned().unwrap_or(Value::Null);
        serde_json::from_value(value).with_context(|| format!("Unmarshalling argument {idx} ({name})"))
    }
}
