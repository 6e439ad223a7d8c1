//! Pass-through: forwards packets unchanged, sharing payloads.
//!
//! Mostly useful to exercise graph plumbing and as a template for
//! transform filters.

use std::sync::Arc;

use sluice_common::Result;
use sluice_rt::{Filter, FilterImpl, FilterRegister, Pid, PidInstance};

#[derive(Default)]
struct PassThrough {
    out_pid: Option<Arc<Pid>>,
}

impl FilterImpl for PassThrough {
    fn configure_pid(
        &mut self,
        filter: &Arc<Filter>,
        inst: &Arc<PidInstance>,
        is_remove: bool,
    ) -> Result<()> {
        if is_remove {
            return Ok(());
        }
        let out = match &self.out_pid {
            Some(out) => Arc::clone(out),
            None => {
                let out = filter.new_pid();
                self.out_pid = Some(Arc::clone(&out));
                out
            }
        };
        if let Some(src) = inst.pid() {
            out.copy_properties(&src)?;
        }
        Ok(())
    }

    fn process(&mut self, filter: &Arc<Filter>) -> Result<()> {
        let Some(inst) = filter.input_pid(0) else {
            return Ok(());
        };
        let Some(out) = &self.out_pid else {
            return Ok(());
        };
        while let Some(pck) = inst.get_packet() {
            out.forward_packet(&pck)?;
            inst.drop_packet();
        }
        if inst.is_eos() {
            out.set_eos();
        }
        Ok(())
    }
}

pub fn register() -> FilterRegister {
    let mut reg = FilterRegister::new("passthrough", || Box::<PassThrough>::default());
    reg.description = "Forward packets unchanged".to_string();
    // no capability constraints: accepts any pid, outputs whatever
    // came in; only reachable through explicit loading
    reg.explicit_only = true;
    reg
}
