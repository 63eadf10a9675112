//! Data models for the application
//!
//! Row structs embed [`AuditEnvelope`]; request bodies that only exist at the API boundary
//! live next to the aggregate they create.

mod amenity;
mod audit;
mod authz;
mod billing;
mod identity;
mod lookup;
mod notification;
mod payment;
mod plan;
mod policy;
mod refund;
mod tenant;
mod verification;

pub use amenity::*;
pub use audit::*;
pub use authz::*;
pub use billing::*;
pub use identity::*;
pub use lookup::*;
pub use notification::*;
pub use payment::*;
pub use plan::*;
pub use policy::*;
pub use refund::*;
pub use tenant::*;
pub use verification::*;
