//! Implementation of the simulated platform model.

use thiserror::Error;

/// Represents an error validating a platform description.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlatformError {
    /// The platform contains no compute nodes.
    #[error("a platform requires at least one compute node")]
    Empty,

    /// The nodes of a homogeneous platform differ in some capacity.
    #[error("compute nodes must be homogeneous (different {0} detected)")]
    Heterogeneous(&'static str),
}

/// Describes a single simulated compute node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSpec {
    /// The node's host name.
    pub name: String,
    /// The number of cores on the node.
    pub cores: u64,
    /// The RAM capacity of the node, in bytes.
    pub ram: u64,
    /// The local disk capacity of the node, in bytes.
    pub disk: u64,
    /// The per-core compute speed of the node, in flop per second.
    pub speed: f64,
}

impl NodeSpec {
    /// Creates a new node descriptor.
    pub fn new(name: impl Into<String>, cores: u64, ram: u64, disk: u64, speed: f64) -> Self {
        Self {
            name: name.into(),
            cores,
            ram,
            disk,
            speed,
        }
    }
}

/// Describes the set of compute nodes managed by a service.
#[derive(Debug, Clone)]
pub struct Platform {
    /// The compute nodes, in declaration order.
    nodes: Vec<NodeSpec>,
}

impl Platform {
    /// Creates a platform from a set of nodes.
    ///
    /// Returns an error if the node set is empty.
    pub fn new(nodes: Vec<NodeSpec>) -> Result<Self, PlatformError> {
        if nodes.is_empty() {
            return Err(PlatformError::Empty);
        }

        Ok(Self { nodes })
    }

    /// Creates a platform from a set of nodes that must be homogeneous.
    ///
    /// Batch services require equal core counts, RAM capacities, and compute
    /// speeds across all of their nodes.
    pub fn homogeneous(nodes: Vec<NodeSpec>) -> Result<Self, PlatformError> {
        let platform = Self::new(nodes)?;

        let first = &platform.nodes[0];
        for node in &platform.nodes[1..] {
            if node.cores != first.cores {
                return Err(PlatformError::Heterogeneous("core counts"));
            }
            if node.ram != first.ram {
                return Err(PlatformError::Heterogeneous("RAM capacities"));
            }
            if node.speed != first.speed {
                return Err(PlatformError::Heterogeneous("compute speeds"));
            }
        }

        Ok(platform)
    }

    /// Gets the number of nodes on the platform.
    pub fn num_nodes(&self) -> u64 {
        self.nodes.len() as u64
    }

    /// Gets the nodes of the platform, in declaration order.
    pub fn nodes(&self) -> &[NodeSpec] {
        &self.nodes
    }

    /// Gets a node by its index.
    ///
    /// # Panics
    ///
    /// Panics if the index is out of bounds.
    pub fn node(&self, index: usize) -> &NodeSpec {
        &self.nodes[index]
    }

    /// Gets the core count of the first node.
    ///
    /// On a homogeneous platform this is the core count of every node.
    pub fn cores_per_node(&self) -> u64 {
        self.nodes[0].cores
    }

    /// Gets the RAM capacity of the first node, in bytes.
    ///
    /// On a homogeneous platform this is the RAM capacity of every node.
    pub fn ram_per_node(&self) -> u64 {
        self.nodes[0].ram
    }

    /// Gets the per-core compute speed of the first node, in flop per
    /// second.
    pub fn speed(&self) -> f64 {
        self.nodes[0].speed
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    /// Makes a node with the given name and core count and fixed other
    /// capacities.
    fn node(name: &str, cores: u64) -> NodeSpec {
        NodeSpec::new(name, cores, 64 * crate::GB, 200 * crate::GB, 50e9)
    }

    #[test]
    fn empty_platform_is_rejected() {
        assert_eq!(Platform::new(Vec::new()).unwrap_err(), PlatformError::Empty);
    }

    #[test]
    fn homogeneity_is_enforced() {
        let err = Platform::homogeneous(vec![node("a", 4), node("b", 8)]).unwrap_err();
        assert_eq!(err, PlatformError::Heterogeneous("core counts"));

        let platform = Platform::homogeneous(vec![node("a", 4), node("b", 4)]).unwrap();
        assert_eq!(platform.num_nodes(), 2);
        assert_eq!(platform.cores_per_node(), 4);
    }

    #[test]
    fn heterogeneous_disks_are_allowed() {
        let mut small = node("b", 4);
        small.disk = crate::GB;
        let platform = Platform::new(vec![node("a", 4), small]).unwrap();
        assert_eq!(platform.node(1).disk, crate::GB);
    }
}
