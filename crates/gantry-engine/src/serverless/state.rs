//! Implementation of the serverless cluster state and its scheduler-visible
//! snapshots.

use std::collections::BTreeSet;

use gantry_sim::NodeSpec;
use indexmap::IndexMap;
use tracing::debug;

use super::function::ImageFile;
use super::function::RegisteredFunction;

/// An image resident on a node's disk.
#[derive(Debug)]
struct DiskImage {
    /// The size of the image, in bytes.
    size: u64,
    /// The number of bound invocations that still need this disk copy (to
    /// load it into RAM). A pinned image cannot be evicted.
    pins: u64,
    /// The date the image was last used, for LRU eviction.
    last_use: f64,
}

/// An image loaded into a node's RAM.
#[derive(Debug)]
struct RamImage {
    /// The size of the image, in bytes.
    size: u64,
    /// The number of running invocations using the loaded image. A used
    /// image cannot be evicted from RAM.
    users: u64,
    /// The date the image was last used, for LRU eviction.
    last_use: f64,
}

/// The authoritative state of one serverless compute node.
///
/// All counters reflect *reservations*: disk space is taken when a copy
/// starts, RAM when a load starts or an invocation starts running, and a
/// core when an invocation is bound to the node.
#[derive(Debug)]
pub(crate) struct NodeState {
    /// The node descriptor.
    spec: NodeSpec,
    /// The number of unreserved cores.
    free_cores: u64,
    /// The unreserved RAM, in bytes.
    free_ram: u64,
    /// The unreserved disk space, in bytes.
    free_disk: u64,
    /// The images resident on the node's disk, by image name.
    disk_images: IndexMap<String, DiskImage>,
    /// The images loaded into the node's RAM, by image name.
    ram_images: IndexMap<String, RamImage>,
    /// The in-flight copies onto the node's disk: image name to size.
    copying: IndexMap<String, u64>,
    /// The in-flight loads into the node's RAM: image name to size.
    loading: IndexMap<String, u64>,
}

impl NodeState {
    /// Creates the state of an idle node.
    pub fn new(spec: NodeSpec) -> Self {
        let free_cores = spec.cores;
        let free_ram = spec.ram;
        let free_disk = spec.disk;
        Self {
            spec,
            free_cores,
            free_ram,
            free_disk,
            disk_images: IndexMap::new(),
            ram_images: IndexMap::new(),
            copying: IndexMap::new(),
            loading: IndexMap::new(),
        }
    }

    /// Gets the node descriptor.
    pub fn spec(&self) -> &NodeSpec {
        &self.spec
    }

    /// Determines if the image is resident on the node's disk.
    pub fn has_disk_image(&self, image: &str) -> bool {
        self.disk_images.contains_key(image)
    }

    /// Determines if the image is loaded into the node's RAM.
    pub fn has_ram_image(&self, image: &str) -> bool {
        self.ram_images.contains_key(image)
    }

    /// Determines if the image is being copied onto the node's disk.
    pub fn is_copying(&self, image: &str) -> bool {
        self.copying.contains_key(image)
    }

    /// Determines if the image is being loaded into the node's RAM.
    pub fn is_loading(&self, image: &str) -> bool {
        self.loading.contains_key(image)
    }

    /// Reserves one core for a bound invocation.
    pub fn reserve_core(&mut self) -> bool {
        if self.free_cores == 0 {
            return false;
        }
        self.free_cores -= 1;
        true
    }

    /// Evicts unpinned disk images, least recently used first, until the
    /// requested space is free.
    ///
    /// Returns whether the space was freed.
    fn evict_disk_images(&mut self, needed: u64) -> bool {
        while self.free_disk < needed {
            let victim = self
                .disk_images
                .iter()
                .filter(|(_, image)| image.pins == 0)
                .min_by(|(_, a), (_, b)| a.last_use.total_cmp(&b.last_use))
                .map(|(name, _)| name.clone());

            match victim {
                Some(name) => {
                    let image = self.disk_images.shift_remove(&name).expect("victim exists");
                    self.free_disk += image.size;
                    debug!(
                        "evicted image `{name}` from the disk of node `{node}`",
                        node = self.spec.name
                    );
                }
                None => return false,
            }
        }
        true
    }

    /// Evicts unused RAM images, least recently used first, until the
    /// requested space is free.
    ///
    /// Returns whether the space was freed.
    fn evict_ram_images(&mut self, needed: u64) -> bool {
        while self.free_ram < needed {
            let victim = self
                .ram_images
                .iter()
                .filter(|(_, image)| image.users == 0)
                .min_by(|(_, a), (_, b)| a.last_use.total_cmp(&b.last_use))
                .map(|(name, _)| name.clone());

            match victim {
                Some(name) => {
                    let image = self.ram_images.shift_remove(&name).expect("victim exists");
                    self.free_ram += image.size;
                    debug!(
                        "evicted image `{name}` from the RAM of node `{node}`",
                        node = self.spec.name
                    );
                }
                None => return false,
            }
        }
        true
    }

    /// Starts copying an image onto the node's disk, reserving its space
    /// and evicting unpinned images if needed.
    ///
    /// Returns `false`, leaving resident images alone, if the image is
    /// already resident or in flight, or if the space cannot be freed.
    pub fn try_start_copy(&mut self, image: &ImageFile) -> bool {
        if self.has_disk_image(image.name()) || self.is_copying(image.name()) {
            return false;
        }
        if image.size() > self.spec.disk || !self.evict_disk_images(image.size()) {
            return false;
        }

        self.free_disk -= image.size();
        self.copying.insert(image.name().to_string(), image.size());
        true
    }

    /// Completes an in-flight copy, making the image resident.
    pub fn finish_copy(&mut self, image: &str, now: f64) {
        let size = self
            .copying
            .shift_remove(image)
            .expect("a copy completion matches an in-flight copy");
        self.disk_images.insert(image.to_string(), DiskImage {
            size,
            pins: 0,
            last_use: now,
        });
    }

    /// Removes a resident image if it is unpinned, releasing its space.
    pub fn try_remove_image(&mut self, image: &str) -> bool {
        let Some(entry) = self.disk_images.get(image) else {
            return false;
        };
        if entry.pins > 0 {
            return false;
        }

        let entry = self.disk_images.shift_remove(image).expect("image exists");
        self.free_disk += entry.size;
        true
    }

    /// Pins a resident image on behalf of a bound invocation.
    pub fn pin_disk_image(&mut self, image: &str, now: f64) {
        let entry = self
            .disk_images
            .get_mut(image)
            .expect("bindings require a resident image");
        entry.pins += 1;
        entry.last_use = now;
    }

    /// Releases a bound invocation's pin on a disk image.
    ///
    /// The disk copy may be gone already if it was evicted after the last
    /// pin was dropped.
    pub fn unpin_disk_image(&mut self, image: &str) {
        if let Some(entry) = self.disk_images.get_mut(image) {
            entry.pins -= 1;
        }
    }

    /// Starts loading a resident image into RAM, reserving its space and
    /// evicting unused RAM images if needed.
    ///
    /// Returns `false` if the space cannot be freed.
    pub fn try_start_load(&mut self, image: &str) -> bool {
        let size = self
            .disk_images
            .get(image)
            .map(|i| i.size)
            .expect("loads require a resident image");

        if !self.evict_ram_images(size) {
            return false;
        }

        self.free_ram -= size;
        self.loading.insert(image.to_string(), size);
        true
    }

    /// Completes an in-flight load, making the image available in RAM.
    pub fn finish_load(&mut self, image: &str, now: f64) {
        let size = self
            .loading
            .shift_remove(image)
            .expect("a load completion matches an in-flight load");
        self.ram_images.insert(image.to_string(), RamImage {
            size,
            users: 0,
            last_use: now,
        });
    }

    /// Reserves the RAM and scratch-disk limits of an invocation about to
    /// run, and marks it as a user of its loaded image.
    ///
    /// Returns `false` if the node cannot hold the reservations right now.
    pub fn try_acquire_run(&mut self, registration: &RegisteredFunction, now: f64) -> bool {
        let image = registration.function().image().name();
        assert!(
            self.has_ram_image(image),
            "an invocation only runs with its image in RAM"
        );

        if self.free_ram < registration.ram_limit() {
            return false;
        }
        if self.free_disk < registration.disk_limit()
            && !self.evict_disk_images(registration.disk_limit())
        {
            return false;
        }

        self.free_ram -= registration.ram_limit();
        self.free_disk -= registration.disk_limit();

        let entry = self.ram_images.get_mut(image).expect("image is in RAM");
        entry.users += 1;
        entry.last_use = now;
        true
    }

    /// Releases everything a terminated invocation held: its core, its RAM
    /// and scratch-disk limits, and its use of the loaded image.
    pub fn release_run(&mut self, registration: &RegisteredFunction, now: f64) {
        self.free_cores += 1;
        self.free_ram += registration.ram_limit();
        self.free_disk += registration.disk_limit();

        let image = registration.function().image().name();
        let entry = self
            .ram_images
            .get_mut(image)
            .expect("running invocations keep their image in RAM");
        entry.users -= 1;
        entry.last_use = now;
    }

    /// Builds the scheduler-visible snapshot of the node.
    pub fn snapshot(&self) -> NodeSnapshot {
        debug_assert!(self.free_cores <= self.spec.cores);
        debug_assert!(self.free_ram <= self.spec.ram);
        debug_assert!(self.free_disk <= self.spec.disk);

        NodeSnapshot {
            total_cores: self.spec.cores,
            available_cores: self.free_cores,
            total_ram: self.spec.ram,
            available_ram: self.free_ram,
            total_disk: self.spec.disk,
            available_disk: self.free_disk,
            resident_images: self.disk_images.keys().cloned().collect(),
            copying_images: self.copying.keys().cloned().collect(),
        }
    }
}

/// The scheduler-visible snapshot of one node.
#[derive(Debug, Clone)]
pub struct NodeSnapshot {
    /// The total number of cores.
    pub total_cores: u64,
    /// The number of available cores.
    pub available_cores: u64,
    /// The total RAM, in bytes.
    pub total_ram: u64,
    /// The available RAM, in bytes.
    pub available_ram: u64,
    /// The total disk space, in bytes.
    pub total_disk: u64,
    /// The available disk space, in bytes.
    pub available_disk: u64,
    /// The names of the images resident on the node's disk.
    pub resident_images: BTreeSet<String>,
    /// The names of the images being copied onto the node's disk.
    pub copying_images: BTreeSet<String>,
}

/// The immutable state-of-the-system snapshot passed to serverless
/// schedulers.
///
/// Schedulers only ever consult this view; all mutation happens in the
/// service that built it.
#[derive(Debug, Clone)]
pub struct SystemState {
    /// The per-node snapshots, in node-declaration order.
    nodes: IndexMap<String, NodeSnapshot>,
}

impl SystemState {
    /// Builds a snapshot from per-node snapshots in declaration order.
    pub(crate) fn new(nodes: IndexMap<String, NodeSnapshot>) -> Self {
        Self { nodes }
    }

    /// Gets the node names, in declaration order.
    pub fn node_names(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(|s| s.as_str())
    }

    /// Gets the snapshot of the given node.
    ///
    /// # Panics
    ///
    /// Panics if the node is unknown.
    pub fn node(&self, name: &str) -> &NodeSnapshot {
        &self.nodes[name]
    }

    /// Gets the available core count of every node, in declaration order.
    pub fn available_cores(&self) -> IndexMap<String, u64> {
        self.nodes
            .iter()
            .map(|(name, snapshot)| (name.clone(), snapshot.available_cores))
            .collect()
    }

    /// Determines if the image is resident on the node's disk.
    pub fn is_image_on_node(&self, node: &str, image: &ImageFile) -> bool {
        self.nodes[node].resident_images.contains(image.name())
    }

    /// Determines if the image is being copied onto the node's disk.
    pub fn is_image_being_copied_to_node(&self, node: &str, image: &ImageFile) -> bool {
        self.nodes[node].copying_images.contains(image.name())
    }
}
