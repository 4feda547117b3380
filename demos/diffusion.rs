//! Explicit heat diffusion of a gaussian pulse on a periodic adaptive mesh. Leaves refine where
//! the gradient is steep and coarsen once the pulse has spread out.
//!
//! Run with `cargo run --example diffusion [settings.ron]`.

use std::path::PathBuf;

use eyre::{Context, Result};
use treeamr::prelude::*;

const U: usize = 0;
const LEVEL: usize = 1;

const STEPS: usize = 400;
const DIFFUSIVITY: f64 = 1.0;
const REFINE_GRADIENT: f64 = 2.0;
const COARSEN_GRADIENT: f64 = 0.5;

fn settings() -> Result<MeshSettings> {
    let Some(path) = std::env::args().nth(1).map(PathBuf::from) else {
        return Ok(MeshSettings {
            block_size: 8,
            ghost: 1,
            max_level: 4,
            boundary: BoundaryPolicy::Periodic,
            max_grading_iterations: None,
        });
    };

    let source = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read settings from {}", path.display()))?;
    Ok(MeshSettings::from_ron(&source)?)
}

fn gaussian(position: [f64; 2]) -> f64 {
    let r2 = (position[0] - 0.5).powi(2) + (position[1] - 0.5).powi(2);
    (-r2 / 0.005).exp()
}

/// Largest one sided difference quotient over the interior, halo included.
fn max_gradient(view: &DataView<'_, 2>) -> Result<f64, MeshError> {
    let u = view.getter::<f64>(U)?;
    let spacing = view.spacing();
    let width = view.width() as isize;

    let mut result = 0.0f64;
    for j in 0..width {
        for i in 0..width {
            let center = *u.get([i, j]);
            result = result
                .max((u.get([i + 1, j]) - center).abs() / spacing[0])
                .max((u.get([i, j + 1]) - center).abs() / spacing[1]);
        }
    }

    Ok(result)
}

/// Records the refinement level of every cell, for inspecting the mesh.
fn tag_level(view: &mut DataView<'_, 2>) {
    let level = view.level() as i64;
    if let Some(mut cells) = view.block_mut().interior_mut::<i64>(LEVEL) {
        cells.fill(level);
    }
}

fn initialize(view: &mut DataView<'_, 2>) -> Result<(), MeshError> {
    let width = view.width() as isize;
    for j in 0..width {
        for i in 0..width {
            let center = view.cell_center([i, j]);
            view.set(U, [i, j], gaussian(center))?;
        }
    }

    tag_level(view);
    Ok(())
}

fn diffuse(view: &mut DataView<'_, 2>, dt: f64) -> Result<(), MeshError> {
    let width = view.width() as isize;
    let spacing = view.spacing();

    let next = {
        let u = view.getter::<f64>(U)?;
        let mut next = Vec::with_capacity((width * width) as usize);

        for j in 0..width {
            for i in 0..width {
                let center = *u.get([i, j]);
                let dxx = (u.get([i - 1, j]) - 2.0 * center + u.get([i + 1, j])) / spacing[0].powi(2);
                let dyy = (u.get([i, j - 1]) - 2.0 * center + u.get([i, j + 1])) / spacing[1].powi(2);
                next.push(center + dt * DIFFUSIVITY * (dxx + dyy));
            }
        }

        next
    };

    let mut values = next.into_iter();
    for j in 0..width {
        for i in 0..width {
            if let Some(value) = values.next() {
                view.set(U, [i, j], value)?;
            }
        }
    }

    tag_level(view);

    let gradient = max_gradient(view)?;
    if gradient > REFINE_GRADIENT {
        view.request_refine();
    } else if gradient < COARSEN_GRADIENT {
        view.request_coarsen();
    }

    Ok(())
}

fn refine_steep(view: &mut DataView<'_, 2>) -> Result<(), MeshError> {
    if max_gradient(view)? > REFINE_GRADIENT {
        view.request_refine();
    }
    Ok(())
}

pub fn main() -> Result<()> {
    env_logger::builder()
        .format_timestamp(None)
        .filter_level(log::LevelFilter::Info)
        .init();

    let settings = settings()?;
    log::info!("Mesh settings:\n{}", settings.to_ron()?);

    let config = MeshConfig::new(settings)?
        .float_field("u", LinearConservative)?
        .int_field("level", Nearest)?;

    let mut mesh = Mesh::new(config, [2, 2])?;
    let domain = mesh.domain();

    // Resolve the initial pulse before evolving it.
    for _ in 0..mesh.settings().max_level {
        mesh.apply_kernel(initialize)?;
        mesh.synchronize()?;
        mesh.apply_kernel(refine_steep)?;
        mesh.restructure()?;
    }
    mesh.apply_kernel(initialize)?;

    let finest = mesh.settings().max_level;
    let spacing = domain.size[0] / ((mesh.size()[0] << finest) * mesh.config().block_size()) as f64;
    let dt = 0.2 * spacing * spacing / DIFFUSIVITY;

    let initial = mesh.integrate(U)?;
    log::info!(
        "Initial mesh: {} leaves, max level {}, total heat {initial:.6}",
        mesh.num_leaves(),
        mesh.max_level()
    );

    for step in 0..STEPS {
        let report = mesh.step(|view| diffuse(view, dt))?;

        if step % 50 == 0 {
            log::info!(
                "Step {step:4}: {} leaves (max level {}), refined {}, coarsened {}, forced {}, heat {:.6}",
                mesh.num_leaves(),
                mesh.max_level(),
                report.refined,
                report.coarsened,
                report.forced,
                mesh.integrate(U)?
            );
        }
    }

    log::info!(
        "Evolved {STEPS} steps, heat drift {:.3e}, memory {} bytes",
        mesh.integrate(U)? - initial,
        mesh.estimate_heap_size()
    );

    Ok(())
}
