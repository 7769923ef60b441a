//! Mock calculator for testing
//!
//! Produces restart data through the backend instead of running a program,
//! so whole pipelines run on either backend without any external binary.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Context;
use parking_lot::Mutex;
use tracing::debug;

use super::{CalcErrorKind, CalcReport, CalcRequest, Calculator};
use crate::backend::Backend;
use crate::file_ref::FileRef;

pub const CHARGE_DENSITY: &str = "charge-density.dat";
pub const DATA_FILE: &str = "data-file-schema.xml";

/// Deterministic calculator that writes fake restart data
pub struct MockCalculator {
    backend: Arc<dyn Backend>,
    /// Calculation types that report failure
    fail_on: BTreeSet<String>,
    walltime_s: f64,
    /// Track all requests made (for assertions)
    requests: Mutex<Vec<CalcRequest>>,
}

impl MockCalculator {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            fail_on: BTreeSet::new(),
            walltime_s: 0.0,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Report a failed calculation for this calculation type
    pub fn fail_on(mut self, calculation: impl Into<String>) -> Self {
        self.fail_on.insert(calculation.into());
        self
    }

    pub fn with_walltime(mut self, walltime_s: f64) -> Self {
        self.walltime_s = walltime_s;
        self
    }

    /// Get all requests made to this calculator
    pub fn requests(&self) -> Vec<CalcRequest> {
        self.requests.lock().clone()
    }

    pub fn last_request(&self) -> Option<CalcRequest> {
        self.requests.lock().last().cloned()
    }

    fn save_dir(request: &CalcRequest) -> anyhow::Result<FileRef> {
        Ok(FileRef::dir(&request.uid, &request.outdir)?
            .join(format!("{}.save", request.prefix), true)?)
    }

    fn stdout(&self, request: &CalcRequest, text: &str) -> anyhow::Result<()> {
        let stem = request
            .input_file
            .rsplit_once('.')
            .map_or(request.input_file.as_str(), |(stem, _)| stem);
        let target = FileRef::file(&request.uid, format!("{stem}.pwo"))?;
        self.backend.write_text(text, &target)?;
        Ok(())
    }
}

impl Calculator for MockCalculator {
    fn calculate(&self, request: &CalcRequest) -> anyhow::Result<CalcReport> {
        self.requests.lock().push(request.clone());
        debug!(uid = %request.uid, calculation = %request.calculation, "mock calculation");

        if self.fail_on.contains(&request.calculation) {
            self.stdout(request, "Error: mock failure\n")?;
            return Ok(CalcReport::failed(
                CalcErrorKind::ProcessFailed,
                format!("mock {} calculation failed", request.calculation),
                self.walltime_s,
            ));
        }

        let save = Self::save_dir(request)?;
        let density = save.join(CHARGE_DENSITY, false)?;

        if request.calculation == "scf" {
            self.backend.mkdir(&save, true, true)?;
            self.backend
                .write_text(&format!("charge density from {}\n", request.uid), &density)?;
            self.backend.write_text(
                &format!("<calculation>{}</calculation>\n", request.calculation),
                &save.join(DATA_FILE, false)?,
            )?;
        } else {
            // restart runs need the staged scf density
            if !self.backend.exists(&density) {
                self.stdout(request, "Error: charge density not found\n")?;
                return Ok(CalcReport::failed(
                    CalcErrorKind::ProcessFailed,
                    format!("{density} not found"),
                    self.walltime_s,
                ));
            }
            let rho = self
                .backend
                .read_text(&density)
                .with_context(|| format!("reading {density}"))?;
            self.backend.write_text(
                &format!("{} eigenvalues from {rho}", request.calculation),
                &save.join(format!("{}.dat", request.calculation), false)?,
            )?;
        }

        self.stdout(request, "JOB DONE.\n")?;
        Ok(CalcReport::completed(self.walltime_s))
    }
}
