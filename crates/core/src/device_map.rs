//! Module placement across devices.
//!
//! The map is computed from hyper-parameters alone, before any tensor exists,
//! so a model larger than one device can be planned without staging it
//! anywhere. The placement unit is the decoder block: a block never spans two
//! devices because its sublayers run sequentially on one hidden state.

use candle_core::Device;

use moss_common::MossConfig;

/// Top-level modules of the model, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleSlot {
    Embedding,
    Block(usize),
    /// Final LayerNorm plus LM head.
    Head,
}

/// Device index of every top-level module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceMap {
    embedding: usize,
    blocks: Vec<usize>,
    head: usize,
}

impl DeviceMap {
    /// Everything on device 0.
    pub fn single(num_layers: usize) -> Self {
        Self {
            embedding: 0,
            blocks: vec![0; num_layers],
            head: 0,
        }
    }

    /// Balanced split of parameter bytes over `num_devices`, keeping modules
    /// in order: each device receives a contiguous run of modules, moving to
    /// the next device once its share of the total would be exceeded.
    pub fn auto(config: &MossConfig, num_devices: usize) -> Self {
        let num_devices = num_devices.max(1);
        if num_devices == 1 {
            return Self::single(config.n_layer);
        }

        let sizes: Vec<usize> = std::iter::once(config.embedding_params())
            .chain(std::iter::repeat(config.block_params()).take(config.n_layer))
            .chain(std::iter::once(config.head_params()))
            .collect();
        let total: usize = sizes.iter().sum();
        let budget = total.div_ceil(num_devices);

        let mut assignment = Vec::with_capacity(sizes.len());
        let mut device = 0;
        let mut used = 0;
        for size in sizes {
            if used > 0 && used + size > budget && device + 1 < num_devices {
                device += 1;
                used = 0;
            }
            assignment.push(device);
            used += size;
        }

        let head = assignment.pop().unwrap_or(0);
        let embedding = if assignment.is_empty() {
            0
        } else {
            assignment.remove(0)
        };
        Self {
            embedding,
            blocks: assignment,
            head,
        }
    }

    pub fn device_index(&self, slot: ModuleSlot) -> usize {
        match slot {
            ModuleSlot::Embedding => self.embedding,
            ModuleSlot::Block(i) => self.blocks[i],
            ModuleSlot::Head => self.head,
        }
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Number of distinct devices that received at least one module.
    pub fn devices_used(&self) -> usize {
        let mut used: Vec<usize> = std::iter::once(self.embedding)
            .chain(self.blocks.iter().copied())
            .chain(std::iter::once(self.head))
            .collect();
        used.sort_unstable();
        used.dedup();
        used.len()
    }
}

/// A device map bound to concrete devices.
pub struct Placement {
    devices: Vec<Device>,
    map: DeviceMap,
}

impl Placement {
    /// All modules on one device.
    pub fn single(device: Device, num_layers: usize) -> Self {
        Self {
            devices: vec![device],
            map: DeviceMap::single(num_layers),
        }
    }

    /// Modules dispatched over `devices` according to `map`.
    pub fn dispatched(devices: Vec<Device>, map: DeviceMap) -> candle_core::Result<Self> {
        let highest = (0..map.num_blocks())
            .map(|i| map.device_index(ModuleSlot::Block(i)))
            .chain([
                map.device_index(ModuleSlot::Embedding),
                map.device_index(ModuleSlot::Head),
            ])
            .max()
            .unwrap_or(0);
        if highest >= devices.len() {
            return Err(candle_core::Error::Msg(format!(
                "device map uses device {highest} but only {} devices are available",
                devices.len()
            )));
        }
        Ok(Self { devices, map })
    }

    pub fn device(&self, slot: ModuleSlot) -> &Device {
        &self.devices[self.map.device_index(slot)]
    }

    pub fn is_sharded(&self) -> bool {
        self.map.devices_used() > 1
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn block_devices(map: &DeviceMap) -> Vec<usize> {
        (0..map.num_blocks())
            .map(|i| map.device_index(ModuleSlot::Block(i)))
            .collect()
    }

    #[test]
    fn single_device_puts_everything_on_zero() {
        let map = DeviceMap::auto(&MossConfig::default(), 1);
        assert_eq!(map, DeviceMap::single(34));
        assert_eq!(map.devices_used(), 1);
    }

    #[test]
    fn auto_map_is_contiguous_and_ordered() {
        let config = MossConfig::default();
        let map = DeviceMap::auto(&config, 4);
        let blocks = block_devices(&map);
        assert_eq!(blocks.len(), config.n_layer);
        assert_eq!(map.device_index(ModuleSlot::Embedding), 0);
        assert!(blocks.windows(2).all(|w| w[0] <= w[1] && w[1] - w[0] <= 1));
        assert!(blocks[0] >= map.device_index(ModuleSlot::Embedding));
        assert_eq!(map.device_index(ModuleSlot::Head), 3);
        assert_eq!(map.devices_used(), 4);
    }

    #[test]
    fn auto_map_balances_blocks() {
        let config = MossConfig::default();
        let map = DeviceMap::auto(&config, 2);
        let blocks = block_devices(&map);
        let on_first = blocks.iter().filter(|d| **d == 0).count();
        let on_second = blocks.len() - on_first;
        assert!(on_first.abs_diff(on_second) <= 2, "{on_first} vs {on_second}");
    }

    #[test]
    fn more_devices_than_modules_leaves_some_idle() {
        let config = MossConfig {
            n_layer: 1,
            ..Default::default()
        };
        let map = DeviceMap::auto(&config, 8);
        assert!(map.devices_used() <= 3);
        assert!(map.device_index(ModuleSlot::Head) < 8);
    }

    #[test]
    fn placement_rejects_missing_devices() {
        let map = DeviceMap::auto(&MossConfig::default(), 3);
        assert!(Placement::dispatched(vec![Device::Cpu, Device::Cpu], map.clone()).is_err());
        let placement =
            Placement::dispatched(vec![Device::Cpu, Device::Cpu, Device::Cpu], map).unwrap();
        assert!(placement.is_sharded());
        assert!(placement.device(ModuleSlot::Head).is_cpu());
    }
}
