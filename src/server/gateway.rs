//! The process-level server: every configured listener plus the
//! process-wide logging registry.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinSet;

use super::listener::Listener;
use crate::config::{Config, ListenerConfig};
use crate::error::{GatewayError, Result};
use crate::plugins::PluginRegistry;

/// Owns the listeners of one configuration.
pub struct Server {
    registry: Arc<PluginRegistry>,
    listeners: Vec<(ListenerConfig, Arc<PluginRegistry>)>,
    /// Set once; listeners started later still see it
    shutdown: watch::Sender<bool>,
}

impl Server {
    /// Build every plugin registry of `config`.
    ///
    /// Nothing is bound yet; a bad plugin name or plugin config fails here.
    pub fn new(config: &Config) -> Result<Self> {
        let registry = Arc::new(PluginRegistry::logging_only(&config.logging)?);

        let listeners = config
            .listeners
            .values()
            .map(|listener| {
                let registry = PluginRegistry::for_listener(listener).map_err(|e| match e {
                    GatewayError::Config(msg) => {
                        GatewayError::Config(format!("listener {}: {}", listener.bind, msg))
                    }
                    other => other,
                })?;
                Ok((listener.clone(), Arc::new(registry)))
            })
            .collect::<Result<Vec<_>>>()?;

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            registry,
            listeners,
            shutdown,
        })
    }

    /// Process-wide logging registry
    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    /// Bind every listener. The first bind failure is returned.
    pub async fn bind(&self) -> Result<Vec<Listener>> {
        let mut bound = Vec::with_capacity(self.listeners.len());
        for (config, registry) in &self.listeners {
            let listener = Listener::bind(config.clone(), Arc::clone(registry)).await?;
            let addr = listener
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| config.bind.clone());
            self.registry
                .log_info(None, format_args!("listening for connections: {}", addr));
            bound.push(listener);
        }
        Ok(bound)
    }

    /// Run bound listeners until [`close`](Self::close) is called or one of
    /// them fails.
    ///
    /// The first listener failure stops the others and is returned.
    pub async fn serve(&self, listeners: Vec<Listener>) -> Result<()> {
        let mut tasks = JoinSet::new();
        for listener in listeners {
            tasks.spawn(listener.run(self.shutdown.subscribe()));
        }

        let mut result = Ok(());
        while let Some(joined) = tasks.join_next().await {
            let outcome = joined
                .map_err(|e| GatewayError::Connection(format!("listener task failed: {}", e)))
                .and_then(|r| r);
            if let Err(e) = outcome {
                if result.is_ok() {
                    self.registry
                        .log_error(None, format_args!("listener failed: {}", e));
                    self.shutdown.send_replace(true);
                    result = Err(e);
                }
            }
        }
        result
    }

    /// Bind and serve every listener.
    pub async fn start(&self) -> Result<()> {
        let listeners = self.bind().await?;
        self.serve(listeners).await
    }

    /// Stop accepting connections on every listener.
    ///
    /// Sessions already running are left to finish.
    pub fn close(&self) {
        self.registry.log_info(None, "stopping server");
        self.shutdown.send_replace(true);
    }
}

/// Bound addresses of `listeners`, in order.
pub fn local_addrs(listeners: &[Listener]) -> Vec<SocketAddr> {
    listeners
        .iter()
        .filter_map(|l| l.local_addr().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_config_from_str;
    use crate::plugins::tests::MemoryLog;
    use tokio::net::TcpStream;

    fn config(yaml: &str) -> Config {
        load_config_from_str(yaml).unwrap()
    }

    #[test]
    fn test_new_fails_on_unknown_plugin() {
        let mut cfg = config(
            r#"
listeners:
  "127.0.0.1:0":
    authentication:
      passthrough: { host: 127.0.0.1 }
"#,
        );
        cfg.listeners
            .values_mut()
            .for_each(|l| { l.logging.insert("syslog".into(), serde_yaml::Value::Null); });

        let err = Server::new(&cfg).err().unwrap();
        assert!(err
            .to_string()
            .contains("could not find logging plugin: syslog"));
        assert!(err.to_string().contains("listener 127.0.0.1:0"));
    }

    #[tokio::test]
    async fn test_start_and_close() {
        let cfg = config(
            r#"
listeners:
  "127.0.0.1:0":
    authentication:
      passthrough: { host: 127.0.0.1 }
"#,
        );
        let server = Arc::new(Server::new(&cfg).unwrap());
        let listeners = server.bind().await.unwrap();
        let addrs = local_addrs(&listeners);
        assert_eq!(addrs.len(), 1);

        let running = tokio::spawn({
            let server = Arc::clone(&server);
            async move { server.serve(listeners).await }
        });

        TcpStream::connect(addrs[0]).await.unwrap();
        server.close();
        running.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_close_before_serve() {
        let cfg = config(
            r#"
listeners:
  "127.0.0.1:0":
    authentication:
      passthrough: { host: 127.0.0.1 }
"#,
        );
        let server = Server::new(&cfg).unwrap();
        let listeners = server.bind().await.unwrap();

        server.close();
        tokio::time::timeout(std::time::Duration::from_secs(5), server.serve(listeners))
            .await
            .expect("serve kept running after close")
            .unwrap();
    }

    #[tokio::test]
    async fn test_bind_conflict_is_reported() {
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();
        let cfg = config(&format!(
            r#"
listeners:
  "{}":
    authentication:
      passthrough: {{ host: 127.0.0.1 }}
"#,
            addr
        ));

        let server = Server::new(&cfg).unwrap();
        let err = server.start().await.unwrap_err();
        assert!(err.to_string().contains("failed to bind"));
    }

    #[test]
    fn test_server_messages_go_to_process_registry() {
        let log = MemoryLog::default();
        let server = Server {
            registry: Arc::new(PluginRegistry::with_plugins(
                None,
                vec![("memory".into(), Box::new(log.clone()))],
            )),
            listeners: Vec::new(),
            shutdown: watch::channel(false).0,
        };

        server.close();
        let entries = log.entries.lock().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].2, "stopping server");
    }
}
