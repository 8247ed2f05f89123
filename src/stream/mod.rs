//! Streaming sample pipeline: port map (data model), decompressor (C2), and
//! reassembly (C7).

pub mod decompress;
pub mod frame_header;
pub mod port_map;
pub mod reassembly;

pub use decompress::{decode_port_payload, DecodedSamples};
pub use frame_header::StreamFrameHeader;
pub use port_map::{ElementType, PortDescriptor, PortMap};
pub use reassembly::{PortReassembly, ReassembledBuffer};
