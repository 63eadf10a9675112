pub mod authz;
pub mod identity;
pub mod lookup;
pub mod policy;
pub mod tenant;
pub mod verification;

pub use authz::PgAuthzRepository;
pub use identity::PgIdentityRepository;
pub use lookup::PgLookupRepository;
pub use policy::PgPolicyRepository;
pub use tenant::PgTenantRepository;
pub use verification::PgVerificationRepository;
