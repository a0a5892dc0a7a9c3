//! An in-process dependency-graph service container: named services are
//! wired together by `requires`/`provides` edges and driven through a
//! lifecycle (DOWN → STARTING → UP → STOPPING → DOWN → REMOVED) by demand
//! propagated from whoever needs them (§1).
//!
//! ```ignore
//! use svcgraph::{Container, ServiceBuilder, Mode};
//!
//! let container = Container::new();
//! container.install(ServiceBuilder::new().provides("db").instance(DbService))?;
//! container.install(
//!     ServiceBuilder::new().provides("api").requires("db").instance(ApiService).mode(Mode::Active),
//! )?;
//! container.await_stability(None).await?;
//! ```

pub mod builder;
pub mod container;
pub mod controller;
pub mod error;
pub mod flags;
pub mod handle;
pub mod link;
pub mod listener;
pub mod mode;
pub mod name;
pub mod registration;
pub mod service;
pub mod substate;
pub mod value;

pub use builder::ServiceBuilder;
pub use container::{AwaitTimeoutError, Container, ShutdownListener, StabilityReport};
pub use controller::Controller;
pub use error::{ContractError, InstallError, StartCause};
pub use handle::ControllerId;
pub use link::LinkKind;
pub use listener::{LifecycleEvent, Listener};
pub use mode::Mode;
pub use name::ServiceName;
pub use service::{Service, StartContext, StopContext};
pub use substate::Substate;
pub use value::ValueCell;
