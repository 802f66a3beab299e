use crate::{common::*, model::GeneratorInit};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub model: Model,
    pub run: Run,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file '{}'", path.display()))?;
        let config: Self = json5::from_str(&text)
            .with_context(|| format!("unable to parse config file '{}'", path.display()))?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    pub n_classes: NonZeroUsize,
    pub n_input: NonZeroUsize,
    pub init_gain: R64,
    pub base_channels: NonZeroUsize,
    #[serde(default = "default_image_size")]
    pub image_size: NonZeroUsize,
}

impl Model {
    pub fn generator_init(&self) -> GeneratorInit {
        GeneratorInit {
            n_classes: self.n_classes.get(),
            n_input: self.n_input.get(),
            init_gain: self.init_gain.raw(),
            base_channels: self.base_channels.get(),
            image_size: self.image_size.get(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    #[serde(with = "tch_serde::serde_device", default = "default_device")]
    pub device: Device,
    pub batch_size: NonZeroUsize,
    #[serde(default)]
    pub seed: u64,
    pub weights_file: Option<PathBuf>,
    pub save_file: Option<PathBuf>,
}

fn default_device() -> Device {
    Device::Cpu
}

fn default_image_size() -> NonZeroUsize {
    NonZeroUsize::new(128).unwrap()
}
