use std::collections::BTreeMap;
use std::net::SocketAddr;

/// Largest frame accepted from a peer unless configured otherwise (64 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Configuration for shell-based task execution on worker nodes.
///
/// When an image is set, each task runs in a throwaway Docker container;
/// otherwise it runs through the local `sh`.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Docker image to run tasks in, or `None` to run them on the host shell
    pub image: Option<String>,
    /// Disable network access in the container
    pub network_disabled: bool,
    /// Memory limit (e.g., "256m")
    pub memory_limit: Option<String>,
    /// CPU limit (e.g., "0.5" for half a CPU)
    pub cpu_limit: Option<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: None,
            network_disabled: true,
            memory_limit: Some("256m".to_string()),
            cpu_limit: Some("0.5".to_string()),
        }
    }
}

/// Load-balancing algorithm selection.
///
/// Parameters are kept as strings so they can be changed through the admin
/// surface; each algorithm parses and validates the keys it knows about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadBalancerConfig {
    pub algorithm: String,
    pub parameters: BTreeMap<String, String>,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            algorithm: "proportional".to_string(),
            parameters: BTreeMap::new(),
        }
    }
}

impl LoadBalancerConfig {
    pub fn new(algorithm: impl Into<String>) -> Self {
        Self {
            algorithm: algorithm.into(),
            parameters: BTreeMap::new(),
        }
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub listen_addr: SocketAddr,
    pub dashboard_addr: Option<SocketAddr>,
    /// Number of tokio worker threads driving the channel state machines
    pub reactor_threads: usize,
    pub max_frame_len: usize,
    pub load_balancer: LoadBalancerConfig,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 11111)),
            dashboard_addr: None,
            reactor_threads: 2,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            load_balancer: LoadBalancerConfig::default(),
        }
    }
}

impl DriverConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_dashboard(mut self, addr: SocketAddr) -> Self {
        self.dashboard_addr = Some(addr);
        self
    }

    pub fn with_load_balancer(mut self, load_balancer: LoadBalancerConfig) -> Self {
        self.load_balancer = load_balancer;
        self
    }
}

/// Configuration of a worker node process.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// host:port of the driver, supports both IP and hostnames
    pub driver_addr: String,
    /// Maximum number of tasks of one bundle executed concurrently
    pub processing_threads: usize,
    pub max_frame_len: usize,
    pub sandbox: SandboxConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            driver_addr: "127.0.0.1:11111".to_string(),
            processing_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            sandbox: SandboxConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn new(driver_addr: impl Into<String>) -> Self {
        Self {
            driver_addr: driver_addr.into(),
            ..Default::default()
        }
    }

    pub fn with_processing_threads(mut self, threads: usize) -> Self {
        self.processing_threads = threads.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sandbox_config_default() {
        let cfg = SandboxConfig::default();
        assert!(cfg.image.is_none());
        assert!(cfg.network_disabled);
        assert_eq!(cfg.memory_limit.as_deref(), Some("256m"));
        assert_eq!(cfg.cpu_limit.as_deref(), Some("0.5"));
    }

    #[test]
    fn load_balancer_config_default() {
        let cfg = LoadBalancerConfig::default();
        assert_eq!(cfg.algorithm, "proportional");
        assert!(cfg.parameters.is_empty());
    }

    #[test]
    fn load_balancer_config_with_parameter() {
        let cfg = LoadBalancerConfig::new("fixed")
            .with_parameter("size", "4")
            .with_parameter("size", "8");
        assert_eq!(cfg.algorithm, "fixed");
        assert_eq!(cfg.parameters.len(), 1);
        assert_eq!(cfg.parameters.get("size").map(String::as_str), Some("8"));
    }

    #[test]
    fn driver_config_default() {
        let cfg = DriverConfig::default();
        assert_eq!(cfg.listen_addr.to_string(), "127.0.0.1:11111");
        assert!(cfg.dashboard_addr.is_none());
        assert_eq!(cfg.reactor_threads, 2);
        assert_eq!(cfg.max_frame_len, DEFAULT_MAX_FRAME_LEN);
    }

    #[test]
    fn driver_config_builders() {
        let addr: SocketAddr = "10.0.0.1:9000".parse().unwrap();
        let dashboard: SocketAddr = "10.0.0.1:9001".parse().unwrap();
        let cfg = DriverConfig::new(addr)
            .with_dashboard(dashboard)
            .with_load_balancer(LoadBalancerConfig::new("fixed"));
        assert_eq!(cfg.listen_addr, addr);
        assert_eq!(cfg.dashboard_addr, Some(dashboard));
        assert_eq!(cfg.load_balancer.algorithm, "fixed");
    }

    #[test]
    fn node_config_processing_threads_never_zero() {
        let cfg = NodeConfig::new("driver:11111").with_processing_threads(0);
        assert_eq!(cfg.driver_addr, "driver:11111");
        assert_eq!(cfg.processing_threads, 1);
    }
}
