use std::io::Write;

use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use crate::archiver::ProgressHandle;
use crate::error::Result;

use super::hierarchy::{file_order, Hierarchy, Namespace};
use super::layout::{ImageLayout, SectorWriter};
use super::options::IsoOptions;
use super::stages::rock_ridge::RockRidgePlan;
use super::stages::{stages_for, Area};
use super::tree::StagingTree;

/// Everything the stages need, derived once from the finished staging tree.
#[derive(Debug)]
pub struct IsoModel {
    pub tree: StagingTree,
    pub primary: Hierarchy,
    pub joliet: Option<Hierarchy>,
    pub rock_ridge: Option<RockRidgePlan>,
    pub file_order: Vec<usize>,
    pub options: IsoOptions,
    pub created: DateTime<Utc>,
}

impl IsoModel {
    pub fn new(tree: StagingTree, options: IsoOptions, created: DateTime<Utc>) -> Result<IsoModel> {
        let primary = Hierarchy::build(&tree, Namespace::Primary)?;
        let joliet = if options.joliet {
            Some(Hierarchy::build(&tree, Namespace::Joliet)?)
        } else {
            None
        };
        let rock_ridge = options
            .rock_ridge
            .then(|| RockRidgePlan::build(&tree, &primary));
        let file_order = file_order(&tree);

        Ok(IsoModel {
            tree,
            primary,
            joliet,
            rock_ridge,
            file_order,
            options,
            created,
        })
    }
}

/// Lays out and writes the whole image. Returns the final layout.
pub fn write_image(
    model: &IsoModel,
    sink: &mut dyn Write,
    progress: ProgressHandle,
) -> Result<ImageLayout> {
    let mut stages = stages_for(model, progress);

    let mut layout = ImageLayout::new();
    for area in Area::ALL {
        for stage in stages.iter() {
            stage.plan_start(area, model, &mut layout)?;
        }
        for stage in stages.iter().rev() {
            stage.plan_end(area, model, &mut layout)?;
        }
    }
    layout.seal();
    debug!(
        sectors = layout.volume_sectors,
        files = model.file_order.len(),
        directories = model.primary.directories.len(),
        "iso layout planned"
    );

    let mut out = SectorWriter::new(sink);
    for area in Area::ALL {
        trace!(area = area.label(), lba = out.lba(), "emitting area");
        for stage in stages.iter_mut() {
            stage.emit_start(area, model, &layout, &mut out)?;
        }
        for stage in stages.iter_mut().rev() {
            trace!(stage = stage.name(), area = area.label(), "closing area");
            stage.emit_end(area, model, &layout, &mut out)?;
        }
    }

    out.expect_lba(layout.volume_sectors, "end of image")?;
    out.flush()?;
    Ok(layout)
}
