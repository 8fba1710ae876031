// Hub service main entry point.
use anyhow::Result;
use hub::config::ServiceConfig;
use hub::{observability, runtime};
use std::future::Future;

#[tokio::main]
async fn main() -> Result<()> {
    run_with_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

async fn run_with_shutdown<F>(shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    observability::init_observability("herald");

    let config = ServiceConfig::from_env_or_yaml()?;
    let mut service = runtime::start(config).await?;
    tracing::info!(hub = %service.hub().id(), "hub started");

    if service.attach_stdin()? {
        // Runs until stdin closes or the process is interrupted.
        tokio::select! {
            _ = shutdown => tracing::info!("shutdown requested"),
            forwarded = service.input_closed() => tracing::info!(forwarded, "input closed"),
        }
    } else {
        shutdown.await;
        tracing::info!("shutdown requested");
    }

    for line in service.dump()? {
        println!("{line}");
    }
    service.shutdown();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    struct EnvGuard {
        key: &'static str,
        prev: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &'static str, value: &str) -> Self {
            let prev = std::env::var(key).ok();
            unsafe {
                std::env::set_var(key, value);
            }
            Self { key, prev }
        }

        fn unset(key: &'static str) -> Self {
            let prev = std::env::var(key).ok();
            unsafe {
                std::env::remove_var(key);
            }
            Self { key, prev }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.prev {
                Some(value) => unsafe {
                    std::env::set_var(self.key, value);
                },
                None => unsafe {
                    std::env::remove_var(self.key);
                },
            }
        }
    }

    const HERALD_VARS: [&str; 9] = [
        "HERALD_CONFIG",
        "HERALD_EVENT_CAPACITY",
        "HERALD_QUERY_LIMIT",
        "HERALD_SEED",
        "HERALD_STDIN_CHANNEL",
        "HERALD_LOG_ROUTE",
        "HERALD_ERROR_CHANNEL",
        "HERALD_DUMP_ROUTE",
        "HERALD_DUMP_LIMIT",
    ];

    #[tokio::test]
    #[serial]
    async fn run_with_shutdown_with_default_env() -> Result<()> {
        let _guards: Vec<EnvGuard> = HERALD_VARS.into_iter().map(EnvGuard::unset).collect();
        run_with_shutdown(async {}).await?;
        Ok(())
    }

    #[tokio::test]
    #[serial]
    async fn run_with_shutdown_rejects_bad_config() {
        let _guards: Vec<EnvGuard> = HERALD_VARS.into_iter().map(EnvGuard::unset).collect();
        let _capacity = EnvGuard::set("HERALD_EVENT_CAPACITY", "0");
        assert!(run_with_shutdown(async {}).await.is_err());
    }
}
