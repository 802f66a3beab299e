use anyhow::Result;
use region_gan::{
    common::*,
    config,
    model::{GeneratorOutput, NoiseRecovery, NoiseSampler},
};
use std::env;
use structopt::StructOpt;
use tracing_subscriber::{filter::LevelFilter, prelude::*, EnvFilter};

#[derive(Debug, Clone, StructOpt)]
/// Redraws each semantic region of a synthetic batch with the region generator.
pub struct Args {
    #[structopt(long, default_value = "config.json5")]
    pub config: PathBuf,
}

fn main() -> Result<()> {
    // setup tracing
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true).compact();
    let filter_layer = {
        let filter = EnvFilter::from_default_env();
        let filter = if env::var("RUST_LOG").is_err() {
            filter.add_directive(LevelFilter::INFO.into())
        } else {
            filter
        };
        filter
    };

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();

    // parse config
    let Args { config } = Args::from_args();
    let config::Config { model, run } = config::Config::load(&config)?;
    let config::Run {
        device,
        batch_size,
        seed,
        weights_file,
        save_file,
    } = run;
    let batch_size = batch_size.get() as i64;
    let n_classes = model.n_classes.get();
    let image_size = model.image_size.get() as i64;

    tch::manual_seed(seed as i64);
    let mut sampler = NoiseSampler::new(seed);

    // initialize model
    let mut vs = nn::VarStore::new(device);
    let root = vs.root();
    let mut generator = model.generator_init().build(&root / "generator")?;

    if let Some(weights_file) = &weights_file {
        vs.load(weights_file)
            .with_context(|| format!("unable to load weights '{}'", weights_file.display()))?;
        info!("loaded weights from '{}'", weights_file.display());
    }

    // synthetic batch
    let real_images =
        Tensor::rand(&[batch_size, 3, image_size, image_size], (Kind::Float, device)) * 2.0 - 1.0;
    let mask_logits = Tensor::randn(
        &[batch_size, n_classes as i64, image_size, image_size],
        (Kind::Float, device),
    ) * 4.0;

    tch::no_grad(|| -> Result<()> {
        for class in 0..generator.n_classes() {
            let GeneratorOutput {
                fake_images,
                recovery,
            } = generator.forward_t(&real_images, &mask_logits, class, true, false, &mut sampler)?;
            let NoiseRecovery {
                noise,
                noise_estimate,
            } = recovery.ok_or_else(|| format_err!("noise recovery is not available"))?;

            let diff = f64::from((&fake_images - &real_images).abs().mean(Kind::Float));
            let recon_error = f64::from((noise_estimate - noise).square().mean(Kind::Float));
            info!(
                "class {}: output range [{:.4}, {:.4}], mean abs diff to real {:.4}, noise recon mse {:.4}",
                class,
                f64::from(fake_images.min()),
                f64::from(fake_images.max()),
                diff,
                recon_error
            );
        }
        Ok(())
    })?;

    if let Some(save_file) = &save_file {
        vs.save(save_file)
            .with_context(|| format!("unable to save weights '{}'", save_file.display()))?;
        info!("saved weights to '{}'", save_file.display());
    }

    Ok(())
}
