//! Router port mappings for the node's access point.
//!
//! When the `NodeGroups` feature is on, the agent keeps the API and tunnel
//! ports mapped on the local Internet gateway. Mappings are leased, so the
//! reconcile loop re-adds them periodically. Failures are only logged.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hearth_spec::{VirtualMachineSpec, FEATURE_NODE_GROUPS};
use reqwest::Client;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How often mappings are re-applied.
pub const MAPPING_PERIOD: Duration = Duration::from_secs(5 * 60);

/// Lease requested for each mapping.
pub const LEASE: Duration = Duration::from_secs(2 * 60 * 60);

const SSDP_ADDR: &str = "239.255.255.250:1900";
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);
const WAN_SERVICES: [&str; 2] = [
    "urn:schemas-upnp-org:service:WANIPConnection:1",
    "urn:schemas-upnp-org:service:WANPPPConnection:1",
];

#[derive(Debug, Error)]
pub enum MappingError {
    #[error("no gateway device discovered")]
    NoGateway,

    #[error("gateway has no WAN connection service")]
    NoWanService,

    #[error("invalid gateway location {0:?}")]
    BadLocation(String),

    #[error("discovery I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("gateway rejected {action}: HTTP {status}")]
    Rejected { action: &'static str, status: u16 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingItem {
    pub external_port: u16,
    pub internal_port: u16,
    pub protocol: Protocol,
    pub description: String,
}

impl MappingItem {
    pub fn tcp(port: u16, description: impl Into<String>) -> Self {
        Self {
            external_port: port,
            internal_port: port,
            protocol: Protocol::Tcp,
            description: description.into(),
        }
    }
}

/// Something that can open a port on the way in.
#[async_trait]
pub trait PortMapper: Send + Sync {
    async fn add_mapping(&self, item: &MappingItem) -> Result<(), MappingError>;
}

/// Ports to keep mapped for `spec`; unset ports are skipped.
pub fn mapping_items(spec: &VirtualMachineSpec) -> Vec<MappingItem> {
    let ap = &spec.access_point;
    [(ap.api_port, "api"), (ap.tunnel_port, "tunnel")]
        .into_iter()
        .filter(|(port, _)| *port != 0)
        .map(|(port, what)| MappingItem::tcp(port, format!("hearth {} {what}", spec.name)))
        .collect()
}

/// Re-apply the mappings for `spec` every `period` until `cancel` fires.
///
/// Returns immediately when the `NodeGroups` feature is off.
pub async fn run_mapping_loop(
    spec: Arc<VirtualMachineSpec>,
    mapper: Arc<dyn PortMapper>,
    period: Duration,
    cancel: CancellationToken,
) {
    if !spec.has_feature(FEATURE_NODE_GROUPS) {
        info!("NodeGroups feature disabled, skipping port mapping");
        return;
    }
    let items = mapping_items(&spec);
    if items.is_empty() {
        info!("No access point ports declared, skipping port mapping");
        return;
    }

    loop {
        for item in &items {
            match mapper.add_mapping(item).await {
                Ok(()) => info!(port = item.external_port, "Port mapped"),
                Err(e) => error!(port = item.external_port, error = %e, "Failed to add port mapping"),
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(period) => {}
            _ = cancel.cancelled() => {
                debug!("Port mapping loop shutting down");
                return;
            }
        }
    }
}

/// UPnP Internet Gateway Device client.
///
/// Discovers the gateway with SSDP on every call and adds mappings with the
/// SOAP `AddPortMapping` action.
#[derive(Debug, Clone)]
pub struct UpnpMapper {
    client: Client,
    discovery_timeout: Duration,
}

impl UpnpMapper {
    pub fn new() -> Result<Self, MappingError> {
        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self {
            client,
            discovery_timeout: DISCOVERY_TIMEOUT,
        })
    }

    async fn discover(&self) -> Result<String, MappingError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let search = format!(
            "M-SEARCH * HTTP/1.1\r\nHOST: {SSDP_ADDR}\r\nST: urn:schemas-upnp-org:device:InternetGatewayDevice:1\r\nMAN: \"ssdp:discover\"\r\nMX: 2\r\n\r\n"
        );
        socket.send_to(search.as_bytes(), SSDP_ADDR).await?;

        let mut buf = [0u8; 2048];
        let (n, from) = tokio::time::timeout(self.discovery_timeout, socket.recv_from(&mut buf))
            .await
            .map_err(|_| MappingError::NoGateway)??;
        let reply = String::from_utf8_lossy(&buf[..n]);
        let location = ssdp_location(&reply).ok_or(MappingError::NoGateway)?;
        debug!(gateway = %from, location = %location, "Discovered gateway");
        Ok(location)
    }

    async fn control_url(&self, location: &str) -> Result<(String, &'static str), MappingError> {
        let description = self
            .client
            .get(location)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        for service in WAN_SERVICES {
            if let Some(path) = find_control_url(&description, service) {
                return Ok((resolve_url(location, &path)?, service));
            }
        }
        Err(MappingError::NoWanService)
    }
}

#[async_trait]
impl PortMapper for UpnpMapper {
    async fn add_mapping(&self, item: &MappingItem) -> Result<(), MappingError> {
        let location = self.discover().await?;
        let (control, service) = self.control_url(&location).await?;
        let internal = local_address_towards(&location).await?;

        let body = format!(
            concat!(
                r#"<?xml version="1.0"?>"#,
                r#"<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/" s:encodingStyle="http://schemas.xmlsoap.org/soap/encoding/">"#,
                r#"<s:Body><u:AddPortMapping xmlns:u="{service}">"#,
                "<NewRemoteHost></NewRemoteHost>",
                "<NewExternalPort>{external}</NewExternalPort>",
                "<NewProtocol>{proto}</NewProtocol>",
                "<NewInternalPort>{internal_port}</NewInternalPort>",
                "<NewInternalClient>{client}</NewInternalClient>",
                "<NewEnabled>1</NewEnabled>",
                "<NewPortMappingDescription>{description}</NewPortMappingDescription>",
                "<NewLeaseDuration>{lease}</NewLeaseDuration>",
                "</u:AddPortMapping></s:Body></s:Envelope>"
            ),
            service = service,
            external = item.external_port,
            proto = item.protocol.as_str(),
            internal_port = item.internal_port,
            client = internal,
            description = item.description,
            lease = LEASE.as_secs(),
        );

        let response = self
            .client
            .post(&control)
            .header("Content-Type", r#"text/xml; charset="utf-8""#)
            .header("SOAPAction", format!("\"{service}#AddPortMapping\""))
            .body(body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(MappingError::Rejected {
                action: "AddPortMapping",
                status: response.status().as_u16(),
            });
        }
        debug!(
            external = item.external_port,
            internal = %SocketAddr::new(internal, item.internal_port),
            "Gateway accepted mapping"
        );
        Ok(())
    }
}

fn ssdp_location(reply: &str) -> Option<String> {
    reply.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.trim()
            .eq_ignore_ascii_case("location")
            .then(|| value.trim().to_string())
    })
}

/// `<controlURL>` of the `<service>` block whose `<serviceType>` is `service`.
fn find_control_url(description: &str, service: &str) -> Option<String> {
    description.split("<service>").skip(1).find_map(|block| {
        let block = block.split("</service>").next()?;
        if tag_text(block, "serviceType")? != service {
            return None;
        }
        tag_text(block, "controlURL").map(str::to_string)
    })
}

fn tag_text<'a>(xml: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = xml.find(&open)? + open.len();
    let len = xml[start..].find(&close)?;
    Some(xml[start..start + len].trim())
}

fn resolve_url(location: &str, path: &str) -> Result<String, MappingError> {
    if path.starts_with("http://") || path.starts_with("https://") {
        return Ok(path.to_string());
    }
    let rest = location
        .strip_prefix("http://")
        .ok_or_else(|| MappingError::BadLocation(location.to_string()))?;
    let authority = rest.split('/').next().unwrap_or(rest);
    let slash = if path.starts_with('/') { "" } else { "/" };
    Ok(format!("http://{authority}{slash}{path}"))
}

async fn local_address_towards(location: &str) -> Result<IpAddr, MappingError> {
    let authority = location
        .strip_prefix("http://")
        .and_then(|rest| rest.split('/').next())
        .ok_or_else(|| MappingError::BadLocation(location.to_string()))?;
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(authority).await?;
    let local = socket.local_addr()?.ip();
    if local.is_unspecified() {
        warn!(location = %location, "Could not determine local address towards gateway");
    }
    Ok(local)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use hearth_spec::VmType;

    #[derive(Default)]
    struct RecordingMapper {
        calls: Mutex<Vec<u16>>,
    }

    #[async_trait]
    impl PortMapper for RecordingMapper {
        async fn add_mapping(&self, item: &MappingItem) -> Result<(), MappingError> {
            self.calls.lock().unwrap().push(item.external_port);
            if item.external_port == 7443 {
                return Err(MappingError::NoGateway);
            }
            Ok(())
        }
    }

    fn spec(node_groups: bool) -> Arc<VirtualMachineSpec> {
        let mut spec = VirtualMachineSpec::new("dev", VmType::Firecracker);
        spec.access_point.api_port = 6443;
        spec.access_point.tunnel_port = 7443;
        spec.features
            .insert(FEATURE_NODE_GROUPS.to_string(), node_groups);
        Arc::new(spec)
    }

    #[tokio::test]
    async fn test_disabled_feature_never_maps() {
        let mapper = Arc::new(RecordingMapper::default());
        run_mapping_loop(
            spec(false),
            mapper.clone(),
            Duration::from_millis(1),
            CancellationToken::new(),
        )
        .await;
        assert!(mapper.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_the_loop() {
        let mapper = Arc::new(RecordingMapper::default());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_mapping_loop(
            spec(true),
            mapper.clone(),
            Duration::from_millis(10),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(60)).await;
        cancel.cancel();
        task.await.unwrap();

        let calls = mapper.calls.lock().unwrap();
        assert!(calls.len() >= 4, "{calls:?}");
        assert_eq!(&calls[..2], &[6443, 7443]);
    }

    #[test]
    fn test_unset_ports_are_skipped() {
        let mut spec = VirtualMachineSpec::new("dev", VmType::Firecracker);
        spec.access_point.api_port = 6443;
        let items = mapping_items(&spec);
        assert_eq!(items, vec![MappingItem::tcp(6443, "hearth dev api")]);
    }

    #[test]
    fn test_ssdp_location() {
        let reply = "HTTP/1.1 200 OK\r\nCACHE-CONTROL: max-age=120\r\nLocation: http://192.168.1.1:5000/rootDesc.xml\r\n\r\n";
        assert_eq!(
            ssdp_location(reply).as_deref(),
            Some("http://192.168.1.1:5000/rootDesc.xml")
        );
        assert_eq!(ssdp_location("HTTP/1.1 200 OK\r\n\r\n"), None);
    }

    #[test]
    fn test_find_control_url() {
        let xml = r#"<root><device><serviceList>
            <service><serviceType>urn:schemas-upnp-org:service:Layer3Forwarding:1</serviceType>
              <controlURL>/ctl/L3F</controlURL></service>
            <service><serviceType>urn:schemas-upnp-org:service:WANIPConnection:1</serviceType>
              <controlURL>/ctl/IPConn</controlURL></service>
        </serviceList></device></root>"#;
        assert_eq!(
            find_control_url(xml, WAN_SERVICES[0]).as_deref(),
            Some("/ctl/IPConn")
        );
        assert_eq!(find_control_url(xml, WAN_SERVICES[1]), None);
    }

    #[test]
    fn test_resolve_url() {
        let base = "http://192.168.1.1:5000/rootDesc.xml";
        assert_eq!(
            resolve_url(base, "/ctl/IPConn").unwrap(),
            "http://192.168.1.1:5000/ctl/IPConn"
        );
        assert_eq!(
            resolve_url(base, "http://10.0.0.1/x").unwrap(),
            "http://10.0.0.1/x"
        );
        assert!(resolve_url("ftp://x/", "/y").is_err());
    }
}
