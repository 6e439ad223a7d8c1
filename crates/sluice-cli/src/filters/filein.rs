//! File source: reads a file in fixed-size blocks onto one pid.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use log::{debug, info};

use sluice_common::{Error, Result, StreamType};
use sluice_rt::{
    keys, CapSlot, Capability, Filter, FilterArgDesc, FilterImpl, FilterRegister, Pid,
    PidInstance, PropValue,
};

const DEFAULT_BLOCK_SIZE: usize = 4096;

struct FileIn {
    file: Option<File>,
    pid: Option<Arc<Pid>>,
    block_size: usize,
    offset: u64,
    done: bool,
}

impl FilterImpl for FileIn {
    fn initialize(&mut self, filter: &Arc<Filter>) -> Result<()> {
        let path = filter.arg("src").ok_or(Error::BadParam)?;
        if let Some(bs) = filter.arg("blocksize") {
            self.block_size = bs.parse().map_err(|_| Error::BadParam)?;
            if self.block_size == 0 {
                return Err(Error::BadParam);
            }
        }
        let file = File::open(&path).map_err(|_| Error::UrlError)?;
        let pid = filter.new_pid();
        pid.set_property(
            keys::STREAM_TYPE,
            Some(PropValue::Uint(StreamType::File as u32)),
        )?;
        pid.set_property(keys::URL, Some(PropValue::String(path.clone())))?;
        if let Some(ext) = Path::new(&path).extension().and_then(|e| e.to_str()) {
            pid.set_property(keys::FILE_EXT, Some(PropValue::String(ext.to_string())))?;
        }
        info!("filein: reading {path} in blocks of {}", self.block_size);
        self.file = Some(file);
        self.pid = Some(pid);
        Ok(())
    }

    fn configure_pid(
        &mut self,
        _filter: &Arc<Filter>,
        _inst: &Arc<PidInstance>,
        _is_remove: bool,
    ) -> Result<()> {
        // source only, never called
        Err(Error::NotSupported)
    }

    fn process(&mut self, _filter: &Arc<Filter>) -> Result<()> {
        if self.done {
            return Err(Error::Eos);
        }
        let pid = self.pid.as_ref().ok_or(Error::ServiceError)?;
        if pid.would_block() {
            return Ok(());
        }
        let file = self.file.as_mut().ok_or(Error::ServiceError)?;

        let mut pck = pid.new_packet_alloc(self.block_size).ok_or(Error::OutOfMemory)?;
        let nb_read = file.read(pck.data_mut())?;
        if nb_read == 0 {
            pck.discard();
            self.done = true;
            pid.set_eos();
            return Err(Error::Eos);
        }
        pck.truncate(nb_read)?;
        pck.set_framing(true, true);
        pck.set_byte_offset(self.offset);
        self.offset += nb_read as u64;
        debug!("filein: sending {nb_read} bytes at offset {}", self.offset);
        pck.send()
    }

    fn probe_url(&self, url: &str) -> bool {
        !url.contains("://") || url.starts_with("file://")
    }
}

pub fn register() -> FilterRegister {
    let mut reg = FilterRegister::new("filein", || {
        Box::new(FileIn {
            file: None,
            pid: None,
            block_size: DEFAULT_BLOCK_SIZE,
            offset: 0,
            done: false,
        })
    });
    reg.description = "File source".to_string();
    reg.accepts_inputs = false;
    reg.caps = vec![CapSlot::Item(Capability::output(
        keys::STREAM_TYPE,
        PropValue::Uint(StreamType::File as u32),
    ))];
    reg.args = vec![
        FilterArgDesc {
            name: "src",
            description: "path of the file to read",
            default: None,
        },
        FilterArgDesc {
            name: "blocksize",
            description: "read block size in bytes",
            default: Some("4096"),
        },
    ];
    reg
}
