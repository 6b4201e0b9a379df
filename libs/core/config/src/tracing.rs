//! Process-wide tracing and error report setup
//!
//! [`build_dispatch`] assembles the subscriber for an [`Environment`];
//! [`init_tracing`] installs it globally and hands it back so services can
//! pass the same dispatcher to the worker as its logger.

use crate::Environment;
use tracing::{debug, info, Dispatch};
use tracing_subscriber::{prelude::*, EnvFilter};

/// Filter used in production when `RUST_LOG` is unset
pub const PRODUCTION_FILTER: &str = "info,lapin=warn";

/// Filter used everywhere else when `RUST_LOG` is unset
pub const DEVELOPMENT_FILTER: &str = "debug,lapin=info";

/// Install color-eyre with location sections on and env sections off.
/// Safe to call more than once.
pub fn install_color_eyre() {
    let _ = color_eyre::config::HookBuilder::default()
        .display_location_section(true)
        .display_env_section(false)
        .install();
}

pub fn default_filter(environment: &Environment) -> &'static str {
    if environment.is_production() {
        PRODUCTION_FILTER
    } else {
        DEVELOPMENT_FILTER
    }
}

/// `RUST_LOG` when it parses, the environment's default otherwise
pub fn env_filter(environment: &Environment) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter(environment)))
}

/// Build the subscriber for `environment` without installing it.
///
/// - **Production**: flattened JSON lines, no module targets
/// - **Development**: pretty output with targets
///
/// Both carry an `ErrorLayer` so eyre reports include span traces.
pub fn build_dispatch(environment: &Environment) -> Dispatch {
    let filter = env_filter(environment);

    if environment.is_production() {
        Dispatch::new(
            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_target(false)
                        .flatten_event(true),
                )
                .with(tracing_error::ErrorLayer::default())
                .with(filter),
        )
    } else {
        Dispatch::new(
            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(true)
                        .with_file(false)
                        .with_line_number(false)
                        .pretty(),
                )
                .with(tracing_error::ErrorLayer::default())
                .with(filter),
        )
    }
}

/// Install the environment's subscriber as the global default and return it.
///
/// When a global subscriber is already set (common in tests) that one is
/// returned instead, so callers always get the dispatcher events go to.
pub fn init_tracing(environment: &Environment) -> Dispatch {
    let dispatch = build_dispatch(environment);

    match tracing::dispatcher::set_global_default(dispatch.clone()) {
        Ok(()) => {
            info!(environment = ?environment, "Tracing initialized");
            dispatch
        }
        Err(_) => {
            debug!("Tracing already initialized, keeping the existing subscriber");
            tracing::dispatcher::get_default(Dispatch::clone)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::Level;

    fn debug_enabled(dispatch: &Dispatch) -> bool {
        tracing::dispatcher::with_default(dispatch, || tracing::enabled!(Level::DEBUG))
    }

    #[test]
    fn test_default_filter_per_environment() {
        assert_eq!(default_filter(&Environment::Production), "info,lapin=warn");
        assert_eq!(default_filter(&Environment::Development), "debug,lapin=info");
    }

    #[test]
    fn test_env_filter_uses_defaults_without_rust_log() {
        temp_env::with_var_unset("RUST_LOG", || {
            let filter = env_filter(&Environment::Development).to_string();
            assert!(filter.contains("lapin=info"), "{filter}");

            let filter = env_filter(&Environment::Production).to_string();
            assert!(filter.contains("lapin=warn"), "{filter}");
        });
    }

    #[test]
    fn test_env_filter_prefers_rust_log() {
        temp_env::with_var("RUST_LOG", Some("amqp_worker=trace"), || {
            let filter = env_filter(&Environment::Production).to_string();
            assert!(filter.contains("amqp_worker=trace"), "{filter}");
            assert!(!filter.contains("lapin"), "{filter}");
        });
    }

    #[test]
    fn test_production_dispatch_drops_debug_events() {
        temp_env::with_var_unset("RUST_LOG", || {
            assert!(!debug_enabled(&build_dispatch(&Environment::Production)));
        });
    }

    #[test]
    fn test_development_dispatch_keeps_debug_events() {
        temp_env::with_var_unset("RUST_LOG", || {
            assert!(debug_enabled(&build_dispatch(&Environment::Development)));
        });
    }

    #[test]
    fn test_init_tracing_returns_active_dispatch() {
        temp_env::with_var("RUST_LOG", Some("warn"), || {
            let first = init_tracing(&Environment::Development);
            let second = init_tracing(&Environment::Production);
            // The second call hands back the subscriber the first one installed.
            assert!(!debug_enabled(&first));
            assert!(!debug_enabled(&second));
        });
    }
}
