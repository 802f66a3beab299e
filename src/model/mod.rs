mod attention;
mod batch_norm;
mod class_generator;
mod conv;
mod generator;
mod information_network;
mod init;
mod input_block;
mod linear;
pub mod mask;
mod noise;
mod output_block;
mod resnet_block;
mod spectral_norm;

pub use attention::*;
pub use batch_norm::*;
pub use class_generator::*;
pub use conv::*;
pub use generator::*;
pub use information_network::*;
pub use init::*;
pub use input_block::*;
pub use linear::*;
pub use noise::*;
pub use output_block::*;
pub use resnet_block::*;
pub use spectral_norm::*;
