use std::collections::BTreeMap;

use log::{debug, info, warn};

use crate::code::MethodBody;
use crate::strings::{DecryptedString, DecryptionCache};
use crate::unit::CompiledUnit;

/// Default bound on fixed-point iterations.
pub const DEFAULT_ITERATION_CAP: usize = 1000;

/// A transformation over one method body. Returns the number of changes
/// made; zero means the pass found nothing to do.
pub trait MethodPass: Send + Sync {
    fn name(&self) -> &'static str;
    fn run(&self, body: &mut MethodBody) -> usize;
}

/// A transformation that needs the whole unit.
pub trait UnitPass: Send + Sync {
    fn name(&self) -> &'static str;
    fn run(&self, unit: &mut CompiledUnit, ctx: &mut PassContext) -> usize;
}

/// Decides whether a unit was produced by a particular obfuscator.
pub trait Detector: Send + Sync {
    fn name(&self) -> &'static str;
    fn detect(&self, unit: &CompiledUnit) -> bool;
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Repeat {
    Once,
    /// Repeat until a full round reports no changes (or the cap is hit)
    FixedPoint,
}

pub enum Stage {
    /// Method passes run back to back on each body. With `FixedPoint` the
    /// whole group repeats per method.
    Method {
        passes: Vec<Box<dyn MethodPass>>,
        repeat: Repeat,
    },
    Unit {
        pass: Box<dyn UnitPass>,
        repeat: Repeat,
    },
}

/// State shared by the passes of one unit's run.
#[derive(Debug, Default)]
pub struct PassContext {
    pub cache: DecryptionCache,
    pub decrypted: Vec<DecryptedString>,
}

/// What a pipeline run did to a unit.
#[derive(Debug, Default, Clone)]
pub struct PassReport {
    /// Changes per pass name
    pub changes: BTreeMap<&'static str, usize>,
    /// Families whose detectors matched, in registration order
    pub families: Vec<&'static str>,
    /// Fixed-point loops that stopped at the iteration cap
    pub capped: usize,
}

impl PassReport {
    fn record(&mut self, pass: &'static str, changes: usize) {
        if changes > 0 {
            *self.changes.entry(pass).or_default() += changes;
        }
    }

    pub fn total(&self) -> usize {
        self.changes.values().sum()
    }
}

/// An ordered list of stages.
pub struct Pipeline {
    name: &'static str,
    stages: Vec<Stage>,
}

impl Pipeline {
    pub fn new(name: &'static str) -> Pipeline {
        Pipeline { name, stages: vec![] }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn method_group(mut self, passes: Vec<Box<dyn MethodPass>>, repeat: Repeat) -> Pipeline {
        self.stages.push(Stage::Method { passes, repeat });
        self
    }

    pub fn unit_pass(mut self, pass: Box<dyn UnitPass>, repeat: Repeat) -> Pipeline {
        self.stages.push(Stage::Unit { pass, repeat });
        self
    }

    pub fn stage(mut self, stage: Stage) -> Pipeline {
        self.stages.push(stage);
        self
    }

    pub fn run(&self, unit: &mut CompiledUnit, ctx: &mut PassContext, cap: usize, report: &mut PassReport) {
        for stage in &self.stages {
            match stage {
                Stage::Method { passes, repeat } => {
                    let unit_name = unit.name.clone();
                    for method in unit.methods.iter_mut() {
                        let body = match method.body.as_mut() {
                            Some(body) => body,
                            None => continue,
                        };

                        let mut iterations = 0;
                        loop {
                            let mut round = 0;
                            for pass in passes {
                                let changes = pass.run(body);
                                if changes > 0 {
                                    debug!(
                                        "{} | {} made {} changes in {}{}",
                                        unit_name,
                                        pass.name(),
                                        changes,
                                        method.name,
                                        method.descriptor
                                    );
                                }
                                report.record(pass.name(), changes);
                                round += changes;
                            }
                            iterations += 1;

                            if *repeat == Repeat::Once || round == 0 {
                                break;
                            }
                            if iterations >= cap {
                                warn!(
                                    "{} | {}{} still changing after {} iterations of {}",
                                    unit_name, method.name, method.descriptor, cap, self.name
                                );
                                report.capped += 1;
                                break;
                            }
                        }
                    }
                }
                Stage::Unit { pass, repeat } => {
                    let mut iterations = 0;
                    loop {
                        let changes = pass.run(unit, ctx);
                        if changes > 0 {
                            debug!("{} | {} made {} changes", unit.name, pass.name(), changes);
                        }
                        report.record(pass.name(), changes);
                        iterations += 1;

                        if *repeat == Repeat::Once || changes == 0 {
                            break;
                        }
                        if iterations >= cap {
                            warn!("{} | {} still changing after {} iterations", unit.name, pass.name(), cap);
                            report.capped += 1;
                            break;
                        }
                    }
                }
            }
        }
    }
}

/// A detector paired with the pipeline that runs only on matching units.
pub struct Family {
    pub detector: Box<dyn Detector>,
    pub pipeline: Pipeline,
}

/// Runs every matching family pipeline, then the general pipeline.
pub struct PassEngine {
    families: Vec<Family>,
    general: Pipeline,
    iteration_cap: usize,
}

impl PassEngine {
    pub fn new(general: Pipeline, iteration_cap: usize) -> PassEngine {
        PassEngine {
            families: vec![],
            general,
            iteration_cap: iteration_cap.max(1),
        }
    }

    /// Families run in the order they were registered.
    pub fn register_family(mut self, detector: Box<dyn Detector>, pipeline: Pipeline) -> PassEngine {
        self.families.push(Family { detector, pipeline });
        self
    }

    pub fn iteration_cap(&self) -> usize {
        self.iteration_cap
    }

    /// The full deobfuscation engine: the SkidFuscator and Colonial family
    /// pipelines followed by the general simplification pipeline.
    pub fn standard(iteration_cap: usize) -> PassEngine {
        PassEngine::new(crate::families::general_pipeline(), iteration_cap)
            .register_family(
                Box::new(crate::families::SkidFuscatorDetector),
                crate::families::skidfuscator_pipeline(),
            )
            .register_family(
                Box::new(crate::families::ColonialDetector),
                crate::families::colonial_pipeline(),
            )
    }

    pub fn run(&self, unit: &mut CompiledUnit, ctx: &mut PassContext) -> PassReport {
        let mut report = PassReport::default();

        // Detection sees the unit as loaded, before any family rewrites it
        let matched: Vec<&Family> = self
            .families
            .iter()
            .filter(|family| family.detector.detect(unit))
            .collect();

        for family in matched {
            info!("{} | detected {}", unit.name, family.detector.name());
            report.families.push(family.detector.name());
            family.pipeline.run(unit, ctx, self.iteration_cap, &mut report);
        }

        self.general.run(unit, ctx, self.iteration_cap, &mut report);
        report
    }
}
