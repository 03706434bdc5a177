/// Resource declarations: descriptors, the type registry and the kind cluster resource
pub mod cluster;
pub mod descriptor;
pub mod registry;

pub use cluster::{
    Cluster, ClusterHandle, ClusterOutputs, ClusterSpec, IpFamily, KubeProxyMode, Mount,
    MountPropagation, Networking, NodeRole, NodeSpec, PortMapping, PortProtocol,
};
pub use descriptor::{
    OutputRef, PropertyMap, PropertyValue, ResourceDescriptor, ResourceOptions, Urn,
};
pub use registry::{Registry, ResourceKind, ResourceSchema, TypeTag, Validator};
