//! File sink: writes every received packet to a file, honoring byte
//! offsets when the input is seekable data.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::Arc;

use log::info;

use sluice_common::{Error, Result, StreamType};
use sluice_rt::{
    keys, CapSlot, Capability, Event, Filter, FilterArgDesc, FilterImpl, FilterRegister,
    PidInstance, PropValue,
};

struct FileOut {
    writer: Option<BufWriter<File>>,
    path: Option<String>,
    nb_bytes: u64,
    play_sent: bool,
}

impl FilterImpl for FileOut {
    fn initialize(&mut self, filter: &Arc<Filter>) -> Result<()> {
        let path = filter.arg("dst").ok_or(Error::BadParam)?;
        self.path = Some(path);
        // keep the sink alive while the graph settles
        filter.set_sticky(true);
        Ok(())
    }

    fn configure_pid(
        &mut self,
        _filter: &Arc<Filter>,
        inst: &Arc<PidInstance>,
        is_remove: bool,
    ) -> Result<()> {
        if is_remove {
            if let Some(writer) = self.writer.as_mut() {
                let _ = writer.flush();
            }
            return Ok(());
        }
        if self.writer.is_none() {
            let path = self.path.as_ref().ok_or(Error::BadParam)?;
            let file = File::create(path).map_err(|_| Error::IoError)?;
            info!("fileout: writing {path}");
            self.writer = Some(BufWriter::new(file));
        }
        if !self.play_sent {
            self.play_sent = true;
            inst.send_event(Event::play(0.0, 1.0));
        }
        Ok(())
    }

    fn process(&mut self, filter: &Arc<Filter>) -> Result<()> {
        let Some(inst) = filter.input_pid(0) else {
            return Ok(());
        };
        let Some(writer) = self.writer.as_mut() else {
            return Ok(());
        };
        while let Some(pck) = inst.get_packet() {
            writer.write_all(pck.data()).map_err(|_| Error::IoError)?;
            self.nb_bytes += pck.data().len() as u64;
            inst.drop_packet();
        }
        if inst.is_eos() {
            writer.flush().map_err(|_| Error::IoError)?;
            filter.set_status(format!("done, {} bytes", self.nb_bytes));
        } else {
            filter.set_status(format!("{} bytes", self.nb_bytes));
        }
        Ok(())
    }

    fn finalize(&mut self, _filter: &Arc<Filter>) {
        if let Some(writer) = self.writer.as_mut() {
            let _ = writer.flush();
        }
    }

    fn probe_url(&self, url: &str) -> bool {
        !url.contains("://") || url.starts_with("file://")
    }
}

pub fn register() -> FilterRegister {
    let mut reg = FilterRegister::new("fileout", || {
        Box::new(FileOut {
            writer: None,
            path: None,
            nb_bytes: 0,
            play_sent: false,
        })
    });
    reg.description = "File sink".to_string();
    reg.caps = vec![CapSlot::Item(Capability::input(
        keys::STREAM_TYPE,
        PropValue::Uint(StreamType::File as u32),
    ))];
    reg.args = vec![FilterArgDesc {
        name: "dst",
        description: "path of the file to write",
        default: None,
    }];
    reg
}
