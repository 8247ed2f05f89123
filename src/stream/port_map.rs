//! Port map (spec §3 "Port map"): a fixed table indexed by port id.

/// Element type tag for a port's decoded samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementType {
    Int,
    Uint,
    Float,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortDescriptor {
    pub port_id: u16,
    pub control_topic: &'static str,
    pub data_topic: &'static str,
    pub field_id: u16,
    pub field_index: u16,
    pub element_type: ElementType,
    /// Power-of-two exponent of the element bit size (0 => 1 bit, 5 => 32 bits).
    pub bit_size_pow2: u8,
    /// Ratio between the raw 2 Msps sample-id timebase and this port's actual rate.
    pub downsample: u32,
}

impl PortDescriptor {
    pub const fn bit_size(&self) -> u32 {
        1u32 << self.bit_size_pow2
    }

    /// True for ports 0..3, reserved for handshake/pubsub/log/memory traffic
    /// rather than sampled data.
    pub const fn is_reserved(&self) -> bool {
        self.port_id < 4
    }
}

/// Ports 0-3 are reserved; the remaining entries describe the older
/// streaming device's sampled channels (current, voltage, power, current
/// range, general-purpose inputs, and the UART byte stream).
pub const PORT_MAP: &[PortDescriptor] = &[
    PortDescriptor {
        port_id: 0,
        control_topic: "h/ctrl",
        data_topic: "",
        field_id: 0,
        field_index: 0,
        element_type: ElementType::Uint,
        bit_size_pow2: 0,
        downsample: 1,
    },
    PortDescriptor {
        port_id: 1,
        control_topic: "h/pubsub",
        data_topic: "",
        field_id: 0,
        field_index: 0,
        element_type: ElementType::Uint,
        bit_size_pow2: 0,
        downsample: 1,
    },
    PortDescriptor {
        port_id: 2,
        control_topic: "h/log",
        data_topic: "",
        field_id: 0,
        field_index: 0,
        element_type: ElementType::Uint,
        bit_size_pow2: 3,
        downsample: 1,
    },
    PortDescriptor {
        port_id: 3,
        control_topic: "h/mem",
        data_topic: "",
        field_id: 0,
        field_index: 0,
        element_type: ElementType::Uint,
        bit_size_pow2: 3,
        downsample: 1,
    },
    PortDescriptor {
        port_id: 16,
        control_topic: "s/i/ctrl",
        data_topic: "s/i/!data",
        field_id: 1,
        field_index: 0,
        element_type: ElementType::Float,
        bit_size_pow2: 5,
        downsample: 1,
    },
    PortDescriptor {
        port_id: 17,
        control_topic: "s/v/ctrl",
        data_topic: "s/v/!data",
        field_id: 1,
        field_index: 1,
        element_type: ElementType::Float,
        bit_size_pow2: 5,
        downsample: 1,
    },
    PortDescriptor {
        port_id: 18,
        control_topic: "s/p/ctrl",
        data_topic: "s/p/!data",
        field_id: 1,
        field_index: 2,
        element_type: ElementType::Float,
        bit_size_pow2: 5,
        downsample: 1,
    },
    PortDescriptor {
        port_id: 19,
        control_topic: "s/i/range/ctrl",
        data_topic: "s/i/range/!data",
        field_id: 1,
        field_index: 3,
        element_type: ElementType::Uint,
        bit_size_pow2: 2,
        downsample: 1,
    },
    PortDescriptor {
        port_id: 20,
        control_topic: "s/gpi/0/ctrl",
        data_topic: "s/gpi/0/!data",
        field_id: 2,
        field_index: 0,
        element_type: ElementType::Uint,
        bit_size_pow2: 0,
        downsample: 1,
    },
    PortDescriptor {
        port_id: 21,
        control_topic: "s/gpi/1/ctrl",
        data_topic: "s/gpi/1/!data",
        field_id: 2,
        field_index: 1,
        element_type: ElementType::Uint,
        bit_size_pow2: 0,
        downsample: 1,
    },
    PortDescriptor {
        port_id: 22,
        control_topic: "s/uart/0/ctrl",
        data_topic: "s/uart/0/!data",
        field_id: 3,
        field_index: 0,
        element_type: ElementType::Uint,
        bit_size_pow2: 3,
        downsample: 16,
    },
];

/// Lookup table keyed by port id.
#[derive(Debug, Default)]
pub struct PortMap;

impl PortMap {
    pub fn lookup(port_id: u16) -> Option<&'static PortDescriptor> {
        PORT_MAP.iter().find(|p| p.port_id == port_id)
    }
}
