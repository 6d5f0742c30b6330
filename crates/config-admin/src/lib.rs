//! # Maple Config Admin - Versioned Configuration Delivery
//!
//! This crate distributes named, versioned configuration dictionaries to
//! consumers ("targets") that come and go at runtime.
//!
//! ## Overview
//!
//! - **Ordered delivery**: every change becomes a task on a single-worker
//!   queue, so targets observe changes in submission order
//! - **At most once per revision**: each target keeps a ledger of what it
//!   has already received
//! - **Targeted PIDs**: `pid|name|version|location` configurations win over
//!   less specific ones for matching targets
//! - **Ownership**: configurations are bound to an owner location, either
//!   explicitly or dynamically on first delivery
//! - **Coordinations**: changes made under a [`Coordination`] are buffered,
//!   compacted and released when it ends
//!
//! ## Key Components
//!
//! - [`ConfigurationManager`]: public operations and orchestration
//! - [`ConfigurationStore`]: cache of live configurations
//! - [`BindingTracker`]: persisted dynamic bindings
//! - [`DeliveryQueue`]: ordered single-consumer task queue
//! - [`CoordinationBatcher`]: transactional buffering and compaction
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use maple_config_admin::{
//!     ConfigurationManager, InMemoryPersistenceManager, InMemoryTargetRegistry, Properties,
//! };
//!
//! # async fn example() -> maple_config_admin::Result<()> {
//! let manager = ConfigurationManager::builder()
//!     .with_persistence(Arc::new(InMemoryPersistenceManager::new()))
//!     .with_registry(Arc::new(InMemoryTargetRegistry::new()))
//!     .start()
//!     .await?;
//!
//! let config = manager.create_configuration("svc.Foo", None).await?;
//! let mut properties = Properties::new();
//! properties.insert("port", 8080);
//! manager.update(&config, properties, true, None).await?;
//! manager.sync().await;
//! manager.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod binding;
pub mod builder;
pub mod config;
pub mod configuration;
pub mod coordination;
pub mod engine;
pub mod error;
pub mod event;
pub mod filter;
pub mod logging;
pub mod manager;
pub mod persistence;
pub mod properties;
pub mod queue;
pub mod registry;
pub mod store;
pub mod target;
pub mod targeted;
pub mod task;
pub mod visibility;

// Re-export main types
pub use binding::BindingTracker;
pub use builder::ConfigurationManagerBuilder;
pub use config::{BindingConfig, ConfigAdminConfig, DeliveryConfig, LoggingConfig};
pub use configuration::{Configuration, ConfigurationSnapshot};
pub use coordination::{compact, Coordination, CoordinationBatcher, Participant};
pub use engine::DeliveryEngine;
pub use error::{ConfigAdminError, ListenerError, Result, TargetError};
pub use event::{
    ConfigurationEvent, ConfigurationEventKind, ConfigurationListener, ListenerId,
    SynchronousConfigurationListener,
};
pub use filter::Filter;
pub use logging::init_tracing;
pub use manager::ConfigurationManager;
pub use persistence::{InMemoryPersistenceManager, PersistenceManager};
pub use properties::{
    Properties, CONFIGURATION_REVISION, SERVICE_BUNDLELOCATION, SERVICE_FACTORYPID, SERVICE_PID,
};
pub use queue::{DeliveryQueue, TaskRunner};
pub use registry::{InMemoryTargetRegistry, TargetRegistry};
pub use store::ConfigurationStore;
pub use target::{Target, TargetHandle, TargetId, TargetKind};
pub use targeted::{TargetIdentity, TargetedPid};
pub use task::{ConfigurationChange, DeliveryTask};
pub use visibility::{PermissionCheck, VisibilityGuard};
