use std::sync::Arc;

use async_trait::async_trait;
use beskar7_domain::PowerState;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::debug;

use crate::client::{
    BootSourceOverride, PowerAction, RedfishClient, RedfishClientFactory, RedfishConnection,
    SystemInfo, VirtualMediaStatus,
};
use crate::error::RedfishError;
use crate::model;

const SERVICE_ROOT_SYSTEMS: &str = "/redfish/v1/Systems";
const SERVICE_ROOT_MANAGERS: &str = "/redfish/v1/Managers";

/// Redfish client over plain HTTP(S).
///
/// `connect` resolves the first `ComputerSystem` and the manager's CD
/// virtual-media slot once; subsequent calls reuse the resolved paths.
#[derive(Debug)]
pub struct HttpRedfishClient {
    http: reqwest::Client,
    address: String,
    username: String,
    password: String,
    system_path: String,
    media_path: String,
}

impl HttpRedfishClient {
    pub async fn connect(conn: &RedfishConnection) -> Result<Self, RedfishError> {
        if !conn.address.starts_with("http://") && !conn.address.starts_with("https://") {
            return Err(RedfishError::InvalidAddress(conn.address.clone()));
        }

        let http = reqwest::Client::builder()
            .timeout(conn.timeout)
            .danger_accept_invalid_certs(conn.insecure_skip_verify)
            .build()
            .map_err(|e| RedfishError::Connection {
                address: conn.address.clone(),
                message: e.to_string(),
            })?;

        let mut client = HttpRedfishClient {
            http,
            address: conn.address.trim_end_matches('/').to_string(),
            username: conn.username.clone(),
            password: conn.password.clone(),
            system_path: String::new(),
            media_path: String::new(),
        };

        client.system_path = client.resolve_system_path().await?;
        client.media_path = client.resolve_media_path().await.unwrap_or_default();
        debug!(address = %client.address, system = %client.system_path, "redfish session established");
        Ok(client)
    }

    async fn resolve_system_path(&self) -> Result<String, RedfishError> {
        let systems: model::Collection = self.get_json(SERVICE_ROOT_SYSTEMS).await?;
        systems
            .members
            .first()
            .map(|m| m.id.clone())
            .ok_or_else(|| RedfishError::Query {
                message: format!("{} has no members", SERVICE_ROOT_SYSTEMS),
            })
    }

    /// Find a virtual-media slot accepting CD/DVD images. Absence is not a
    /// connect failure; media operations will report it when attempted.
    async fn resolve_media_path(&self) -> Result<String, RedfishError> {
        let managers: model::Collection = self.get_json(SERVICE_ROOT_MANAGERS).await?;
        let manager_path = managers
            .members
            .first()
            .map(|m| m.id.clone())
            .ok_or_else(|| RedfishError::Query {
                message: format!("{} has no members", SERVICE_ROOT_MANAGERS),
            })?;

        let manager: model::Manager = self.get_json(&manager_path).await?;
        let collection_path = manager.virtual_media.ok_or_else(|| RedfishError::Query {
            message: format!("manager {manager_path} exposes no virtual media"),
        })?;

        let media: model::Collection = self.get_json(&collection_path.id).await?;
        for slot in &media.members {
            let detail: model::VirtualMedia = self.get_json(&slot.id).await?;
            if detail.media_types.iter().any(|t| t == "CD" || t == "DVD") {
                return Ok(slot.id.clone());
            }
        }
        // Fall back to the first slot when media types are not advertised.
        media
            .members
            .first()
            .map(|m| m.id.clone())
            .ok_or_else(|| RedfishError::Query {
                message: "virtual media collection is empty".to_string(),
            })
    }

    fn media_path(&self) -> Result<&str, RedfishError> {
        if self.media_path.is_empty() {
            Err(RedfishError::VirtualMedia {
                message: "BMC exposes no virtual media slot".to_string(),
            })
        } else {
            Ok(&self.media_path)
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, RedfishError> {
        let url = format!("{}{}", self.address, path);
        let resp = self
            .http
            .get(&url)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(|e| RedfishError::from_reqwest(&self.address, e))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(RedfishError::Http {
                status: status.as_u16(),
                path: path.to_string(),
                message: resp.text().await.unwrap_or_default(),
            });
        }
        resp.json::<T>()
            .await
            .map_err(|e| RedfishError::Query { message: e.to_string() })
    }

    async fn send_body(
        &self,
        method: reqwest::Method,
        path: &str,
        body: serde_json::Value,
    ) -> Result<(), RedfishError> {
        let url = format!("{}{}", self.address, path);
        let resp = self
            .http
            .request(method, &url)
            .basic_auth(&self.username, Some(&self.password))
            .json(&body)
            .send()
            .await
            .map_err(|e| RedfishError::from_reqwest(&self.address, e))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(RedfishError::Http {
                status: status.as_u16(),
                path: path.to_string(),
                message: resp.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }

    fn parse_power_state(raw: &str) -> PowerState {
        match raw {
            "On" => PowerState::On,
            "Off" => PowerState::Off,
            "PoweringOn" => PowerState::PoweringOn,
            "PoweringOff" => PowerState::PoweringOff,
            _ => PowerState::Unknown,
        }
    }
}

#[async_trait]
impl RedfishClient for HttpRedfishClient {
    async fn get_system_info(&self) -> Result<SystemInfo, RedfishError> {
        let system: model::ComputerSystem = self.get_json(&self.system_path).await?;
        Ok(SystemInfo {
            manufacturer: system.manufacturer,
            model: system.model,
            serial_number: system.serial_number,
            memory_mib: (system.memory_summary.total_system_memory_gib * 1024.0) as u64,
            cpu_count: system.processor_summary.count,
        })
    }

    async fn get_power_state(&self) -> Result<PowerState, RedfishError> {
        let system: model::ComputerSystem = self.get_json(&self.system_path).await?;
        Ok(Self::parse_power_state(&system.power_state))
    }

    async fn set_power_state(&self, action: PowerAction) -> Result<(), RedfishError> {
        let path = format!("{}/Actions/ComputerSystem.Reset", self.system_path);
        self.send_body(
            reqwest::Method::POST,
            &path,
            json!({ "ResetType": action.reset_type() }),
        )
        .await
        .map_err(|e| match e {
            RedfishError::Http { status, message, .. } => RedfishError::Power {
                message: format!("reset rejected with status {status}: {message}"),
            },
            other => other,
        })
    }

    async fn insert_virtual_media(&self, image_url: &str) -> Result<(), RedfishError> {
        let path = format!("{}/Actions/VirtualMedia.InsertMedia", self.media_path()?);
        self.send_body(
            reqwest::Method::POST,
            &path,
            json!({ "Image": image_url, "Inserted": true, "WriteProtected": true }),
        )
        .await
        .map_err(|e| match e {
            RedfishError::Http { status, message, .. } => RedfishError::VirtualMedia {
                message: format!("insert rejected with status {status}: {message}"),
            },
            other => other,
        })
    }

    async fn eject_virtual_media(&self) -> Result<(), RedfishError> {
        let path = format!("{}/Actions/VirtualMedia.EjectMedia", self.media_path()?);
        self.send_body(reqwest::Method::POST, &path, json!({}))
            .await
            .map_err(|e| match e {
                RedfishError::Http { status, message, .. } => RedfishError::VirtualMedia {
                    message: format!("eject rejected with status {status}: {message}"),
                },
                other => other,
            })
    }

    async fn get_virtual_media(&self) -> Result<VirtualMediaStatus, RedfishError> {
        let detail: model::VirtualMedia = self.get_json(self.media_path()?).await?;
        Ok(VirtualMediaStatus {
            inserted: detail.inserted.unwrap_or(false),
            image: detail.image.filter(|s| !s.is_empty()),
        })
    }

    async fn set_boot_source_override(
        &self,
        boot: &BootSourceOverride,
    ) -> Result<(), RedfishError> {
        self.send_body(
            reqwest::Method::PATCH,
            &self.system_path,
            json!({
                "Boot": {
                    "BootSourceOverrideEnabled": boot.enabled,
                    "BootSourceOverrideTarget": boot.target,
                    "UefiTargetBootSourceOverride": boot.uefi_target,
                }
            }),
        )
        .await
        .map_err(|e| match e {
            RedfishError::Http { status, message, .. } => RedfishError::Boot {
                message: format!("boot override rejected with status {status}: {message}"),
            },
            other => other,
        })
    }

    async fn set_bios_attribute(&self, name: &str, value: &str) -> Result<(), RedfishError> {
        let path = format!("{}/Bios/Settings", self.system_path);
        self.send_body(
            reqwest::Method::PATCH,
            &path,
            json!({ "Attributes": { name: value } }),
        )
        .await
        .map_err(|e| match e {
            RedfishError::Http { status, message, .. } => RedfishError::Boot {
                message: format!("bios attribute rejected with status {status}: {message}"),
            },
            other => other,
        })
    }
}

#[derive(Debug, Default, Clone)]
pub struct HttpRedfishFactory;

#[async_trait]
impl RedfishClientFactory for HttpRedfishFactory {
    async fn connect(
        &self,
        conn: &RedfishConnection,
    ) -> Result<Arc<dyn RedfishClient>, RedfishError> {
        Ok(Arc::new(HttpRedfishClient::connect(conn).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn mock_bmc() -> MockServer {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/redfish/v1/Systems"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "Members": [{ "@odata.id": "/redfish/v1/Systems/1" }]
            })))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/redfish/v1/Systems/1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "Manufacturer": "Contoso",
                "Model": "R750",
                "SerialNumber": "SN-42",
                "PowerState": "Off",
                "MemorySummary": { "TotalSystemMemoryGiB": 256.0 },
                "ProcessorSummary": { "Count": 64 }
            })))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/redfish/v1/Managers"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "Members": [{ "@odata.id": "/redfish/v1/Managers/1" }]
            })))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/redfish/v1/Managers/1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "VirtualMedia": { "@odata.id": "/redfish/v1/Managers/1/VirtualMedia" }
            })))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/redfish/v1/Managers/1/VirtualMedia"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "Members": [{ "@odata.id": "/redfish/v1/Managers/1/VirtualMedia/Cd" }]
            })))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/redfish/v1/Managers/1/VirtualMedia/Cd"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "Inserted": false,
                "Image": null,
                "MediaTypes": ["CD", "DVD"]
            })))
            .mount(&server)
            .await;

        server
    }

    fn conn(server: &MockServer) -> RedfishConnection {
        RedfishConnection {
            address: server.uri(),
            username: "admin".into(),
            password: "secret".into(),
            insecure_skip_verify: false,
            timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn connect_resolves_system_and_media_paths() {
        let server = mock_bmc().await;
        let client = HttpRedfishClient::connect(&conn(&server)).await.unwrap();
        assert_eq!(client.system_path, "/redfish/v1/Systems/1");
        assert_eq!(client.media_path, "/redfish/v1/Managers/1/VirtualMedia/Cd");
    }

    #[tokio::test]
    async fn system_info_and_power_state() {
        let server = mock_bmc().await;
        let client = HttpRedfishClient::connect(&conn(&server)).await.unwrap();

        let info = client.get_system_info().await.unwrap();
        assert_eq!(info.manufacturer, "Contoso");
        assert_eq!(info.serial_number, "SN-42");
        assert_eq!(info.memory_mib, 256 * 1024);
        assert_eq!(info.cpu_count, 64);

        assert_eq!(client.get_power_state().await.unwrap(), PowerState::Off);
    }

    #[tokio::test]
    async fn power_on_posts_reset_action() {
        let server = mock_bmc().await;
        Mock::given(method("POST"))
            .and(path("/redfish/v1/Systems/1/Actions/ComputerSystem.Reset"))
            .and(body_partial_json(serde_json::json!({ "ResetType": "On" })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let client = HttpRedfishClient::connect(&conn(&server)).await.unwrap();
        client.set_power_state(PowerAction::On).await.unwrap();
    }

    #[tokio::test]
    async fn insert_media_posts_image_url() {
        let server = mock_bmc().await;
        Mock::given(method("POST"))
            .and(path(
                "/redfish/v1/Managers/1/VirtualMedia/Cd/Actions/VirtualMedia.InsertMedia",
            ))
            .and(body_partial_json(
                serde_json::json!({ "Image": "http://img/kairos.iso" }),
            ))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let client = HttpRedfishClient::connect(&conn(&server)).await.unwrap();
        client.insert_virtual_media("http://img/kairos.iso").await.unwrap();
    }

    #[tokio::test]
    async fn server_error_maps_to_http_error() {
        let server = mock_bmc().await;
        Mock::given(method("POST"))
            .and(path("/redfish/v1/Systems/1/Actions/ComputerSystem.Reset"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = HttpRedfishClient::connect(&conn(&server)).await.unwrap();
        let err = client.set_power_state(PowerAction::On).await.unwrap_err();
        assert!(matches!(err, RedfishError::Power { .. }));
    }

    #[tokio::test]
    async fn connect_failure_is_a_connection_error() {
        // Nothing listens on this port.
        let conn = RedfishConnection {
            address: "http://127.0.0.1:1".into(),
            username: "admin".into(),
            password: "secret".into(),
            insecure_skip_verify: false,
            timeout: Duration::from_secs(1),
        };
        let err = HttpRedfishClient::connect(&conn).await.unwrap_err();
        assert_eq!(err.kind(), beskar7_domain::ErrorKind::Connection);
    }

    #[tokio::test]
    async fn non_http_address_is_rejected() {
        let conn = RedfishConnection {
            address: "bmc-1.local".into(),
            username: "admin".into(),
            password: "secret".into(),
            insecure_skip_verify: false,
            timeout: Duration::from_secs(1),
        };
        let err = HttpRedfishClient::connect(&conn).await.unwrap_err();
        assert!(matches!(err, RedfishError::InvalidAddress(_)));
    }
}
