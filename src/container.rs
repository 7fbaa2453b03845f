//! Reading and writing the archives compiled units travel in.

use std::fs::File;
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};

use log::{debug, trace};
use memmap::MmapOptions;
use zip::write::FileOptions;
use zip::CompressionMethod;

use crate::error::Error;

pub const CLASS_MAGIC: [u8; 4] = [0xCA, 0xFE, 0xBA, 0xBE];
pub const OUTPUT_COMMENT: &str = "Deobfuscated by unskid";

pub fn is_compiled_unit(data: &[u8]) -> bool {
    data.starts_with(&CLASS_MAGIC)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub name: String,
    pub data: Vec<u8>,
    pub is_dir: bool,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ContainerKind {
    /// A zip or jar
    Archive,
    /// A bare `.class` file
    SingleUnit,
}

/// An input split into compiled units and everything else.
#[derive(Debug)]
pub struct Container {
    pub kind: ContainerKind,
    pub units: Vec<Entry>,
    /// Directories and non-class files, passed through untouched
    pub resources: Vec<Entry>,
}

impl Container {
    pub fn read(path: &Path) -> Result<Container, Error> {
        let file = File::open(path)?;
        let mmap = unsafe { MmapOptions::new().map(&file)? };
        Container::from_bytes(&mmap, &file_name(path))
    }

    /// `name` is used for the single unit when `data` is a bare class file.
    pub fn from_bytes(data: &[u8], name: &str) -> Result<Container, Error> {
        if is_compiled_unit(data) {
            return Ok(Container {
                kind: ContainerKind::SingleUnit,
                units: vec![Entry {
                    name: name.to_string(),
                    data: data.to_vec(),
                    is_dir: false,
                }],
                resources: vec![],
            });
        }

        let mut zip = zip::ZipArchive::new(Cursor::new(data))?;
        let mut units = vec![];
        let mut resources = vec![];
        for i in 0..zip.len() {
            let mut file = zip.by_index(i)?;
            let name = file.name().to_string();
            trace!("entry {:?}", name);

            let mut contents = Vec::with_capacity(file.size() as usize);
            file.read_to_end(&mut contents)?;
            let entry = Entry {
                name,
                data: contents,
                is_dir: file.is_dir(),
            };
            if !entry.is_dir && is_compiled_unit(&entry.data) {
                units.push(entry);
            } else {
                resources.push(entry);
            }
        }
        debug!("{} compiled units, {} other entries", units.len(), resources.len());

        Ok(Container {
            kind: ContainerKind::Archive,
            units,
            resources,
        })
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// `dir/app.jar` becomes `<output_dir or dir>/app-deobf.jar`.
pub fn output_path(input: &Path, output_dir: Option<&Path>) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match input.extension() {
        Some(ext) => format!("{}-deobf.{}", stem, ext.to_string_lossy()),
        None => format!("{}-deobf", stem),
    };
    let dir = match output_dir {
        Some(dir) => dir.to_path_buf(),
        None => input.parent().map(Path::to_path_buf).unwrap_or_default(),
    };
    dir.join(name)
}

enum Sink {
    Archive(zip::ZipWriter<File>),
    SingleUnit(File),
}

/// Writes entries out as they arrive. Entries already written stay valid
/// if a later write fails.
pub struct ContainerWriter {
    sink: Sink,
    written: usize,
}

impl ContainerWriter {
    pub fn create(path: &Path, kind: ContainerKind) -> Result<ContainerWriter, Error> {
        let file = File::create(path)?;
        let sink = match kind {
            ContainerKind::Archive => {
                let mut zip = zip::ZipWriter::new(file);
                zip.set_comment(OUTPUT_COMMENT);
                Sink::Archive(zip)
            }
            ContainerKind::SingleUnit => Sink::SingleUnit(file),
        };
        Ok(ContainerWriter { sink, written: 0 })
    }

    pub fn write_entry(&mut self, entry: &Entry) -> Result<(), Error> {
        match &mut self.sink {
            Sink::Archive(zip) => {
                let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
                if entry.is_dir {
                    zip.add_directory(entry.name.as_str(), options)?;
                } else {
                    zip.start_file(entry.name.as_str(), options)?;
                    zip.write_all(&entry.data)?;
                }
            }
            Sink::SingleUnit(file) => {
                if self.written > 0 {
                    return Err(Error::Write(format!(
                        "single class output already holds a unit, cannot add {}",
                        entry.name
                    )));
                }
                file.write_all(&entry.data)?;
            }
        }
        self.written += 1;
        Ok(())
    }

    pub fn written(&self) -> usize {
        self.written
    }

    pub fn finish(self) -> Result<usize, Error> {
        match self.sink {
            Sink::Archive(mut zip) => {
                zip.finish()?;
            }
            Sink::SingleUnit(mut file) => file.flush()?,
        }
        Ok(self.written)
    }
}
