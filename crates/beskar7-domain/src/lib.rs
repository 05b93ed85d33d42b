pub mod conditions;
pub mod error;
pub mod host_state;
pub mod provider_id;
pub mod types;
pub mod validate;


pub use conditions::{get_condition, set_condition, Condition, ConditionStatus};
pub use error::{DomainError, ErrorKind};
pub use provider_id::{format_provider_id, parse_provider_id, PROVIDER_ID_PREFIX};
pub use types::{
    AddressType, Beskar7Cluster, Beskar7Machine, ClusterSpec, ClusterStatus, ConsumerRef,
    ControlPlaneEndpoint, HardwareDetails, HostState, MachineAddress, MachinePhase, MachineSpec,
    MachineStatus, ObjectKey, ObjectMeta, OsFamily, PhysicalHost, PhysicalHostSpec,
    PhysicalHostStatus, PowerState, ProvisioningMode, HOST_FINALIZER, MACHINE_FINALIZER,
};
pub use validate::{validate_cluster, validate_machine};
