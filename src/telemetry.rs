use crate::settings::LogSettings;

/// Installs the process-wide logger.
///
/// `RUST_LOG` wins over the configured level. Without the `observability`
/// feature, `tracing` events reach `env_logger` through tracing's `log`
/// bridge; with it, a `tracing-subscriber` formatter (optionally JSON) takes
/// both `tracing` events and `log` records.
pub fn init_logging(settings: &LogSettings) {
    #[cfg(feature = "observability")]
    {
        use tracing_subscriber::EnvFilter;

        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(settings.level.as_str()));
        let builder = tracing_subscriber::fmt().with_env_filter(filter);
        let installed = if settings.json {
            builder.json().try_init()
        } else {
            builder.try_init()
        };
        if let Err(e) = installed {
            eprintln!("logger already installed: {}", e);
        }
    }

    #[cfg(not(feature = "observability"))]
    {
        let env = env_logger::Env::default().default_filter_or(settings.level.as_str());
        if let Err(e) = env_logger::Builder::from_env(env).try_init() {
            eprintln!("logger already installed: {}", e);
        }
    }
}
