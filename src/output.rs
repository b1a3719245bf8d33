use anyhow::Result;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use trust_dns_proto::rr::Record;

use crate::wire;

/// One answer record, flattened for output.
#[derive(Serialize, Debug, Clone)]
pub struct RecordRow {
    pub name: String,
    pub ttl: i32,
    pub class: String,
    pub rtype: String,
    pub data: String,
}

impl RecordRow {
    pub fn from_record(rec: &Record) -> Self {
        RecordRow {
            name: rec.name().to_utf8(),
            ttl: rec.ttl() as i32,
            class: wire::class_str(rec.dns_class()).to_string(),
            rtype: rec.record_type().to_string(),
            data: rec.data().map(wire::rdata_string).unwrap_or_else(|| "???".to_string()),
        }
    }
}

pub trait OutputWriter: Send + Sync {
    fn write(&self, row: &RecordRow) -> Result<()>;
    fn close(&self) -> Result<()> {
        Ok(())
    }
}

fn open_sink(path: &PathBuf, gzip: bool, append: bool) -> Result<Mutex<Box<dyn Write + Send>>> {
    let mut oo = OpenOptions::new();
    oo.create(true).write(true);
    if append {
        oo.append(true);
    } else {
        oo.truncate(true);
    }
    let f = oo.open(path)?;
    let w: Box<dyn Write + Send> =
        if gzip { Box::new(GzEncoder::new(f, Compression::default())) } else { Box::new(f) };
    Ok(Mutex::new(w))
}

/// Tab-separated `name ttl class type data` lines.
pub struct PlainWriter {
    file: Option<Mutex<Box<dyn Write + Send>>>,
    to_stdout: bool,
}

impl PlainWriter {
    pub fn new(path: Option<PathBuf>, to_stdout: bool, gzip: bool, append: bool) -> Result<Self> {
        let file = match path {
            Some(p) => Some(open_sink(&p, gzip, append)?),
            None => None,
        };
        Ok(PlainWriter { file, to_stdout })
    }
}

impl OutputWriter for PlainWriter {
    fn write(&self, row: &RecordRow) -> Result<()> {
        let line =
            format!("{}\t{}\t{}\t{}\t{}", row.name, row.ttl, row.class, row.rtype, row.data);
        if self.to_stdout {
            println!("{}", line);
        }
        if let Some(f) = &self.file {
            let mut guard = f.lock().unwrap();
            writeln!(guard, "{}", line)?;
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if let Some(f) = &self.file {
            f.lock().unwrap().flush()?;
        }
        Ok(())
    }
}

/// One serialized record per line.
pub struct JsonLinesWriter {
    file: Option<Mutex<Box<dyn Write + Send>>>,
    to_stdout: bool,
}

impl JsonLinesWriter {
    pub fn new(path: Option<PathBuf>, to_stdout: bool, gzip: bool, append: bool) -> Result<Self> {
        let file = match path {
            Some(p) => Some(open_sink(&p, gzip, append)?),
            None => None,
        };
        Ok(JsonLinesWriter { file, to_stdout })
    }
}

impl OutputWriter for JsonLinesWriter {
    fn write(&self, row: &RecordRow) -> Result<()> {
        let line = serde_json::to_string(row)?;
        if self.to_stdout {
            println!("{}", line);
        }
        if let Some(f) = &self.file {
            let mut guard = f.lock().unwrap();
            writeln!(guard, "{}", line)?;
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if let Some(f) = &self.file {
            f.lock().unwrap().flush()?;
        }
        Ok(())
    }
}

pub fn build_writers(
    output: Option<PathBuf>,
    output_type: &str,
    to_stdout: bool,
    gzip: bool,
    append: bool,
) -> Result<Vec<Box<dyn OutputWriter>>> {
    let mut gzip = gzip;
    if let Some(ref p) = output {
        if p.as_os_str().to_str().map_or(false, |s| s.ends_with(".gz")) {
            gzip = true;
        }
    }
    let w: Box<dyn OutputWriter> = match output_type.to_lowercase().as_str() {
        "jsonl" => Box::new(JsonLinesWriter::new(output, to_stdout, gzip, append)?),
        _ => Box::new(PlainWriter::new(output, to_stdout, gzip, append)?),
    };
    Ok(vec![w])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use trust_dns_proto::rr::{Name, RData};

    fn sample_row() -> RecordRow {
        let rec = Record::from_rdata(
            Name::from_utf8("www.example.com.").unwrap(),
            300,
            RData::A(std::net::Ipv4Addr::new(93, 184, 216, 34).into()),
        );
        RecordRow::from_record(&rec)
    }

    #[test]
    fn row_from_record() {
        let row = sample_row();
        assert_eq!(row.name, "www.example.com.");
        assert_eq!(row.ttl, 300);
        assert_eq!(row.class, "IN");
        assert_eq!(row.rtype, "A");
        assert_eq!(row.data, "93.184.216.34");
    }

    #[test]
    fn plain_writer_emits_tab_line() {
        let path = std::env::temp_dir().join("rhammer-output-plain-test.txt");
        let w = PlainWriter::new(Some(path.clone()), false, false, false).unwrap();
        w.write(&sample_row()).unwrap();
        w.close().unwrap();

        let mut contents = String::new();
        std::fs::File::open(&path).unwrap().read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "www.example.com.\t300\tIN\tA\t93.184.216.34\n");
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn jsonl_writer_emits_serialized_rows() {
        let path = std::env::temp_dir().join("rhammer-output-jsonl-test.jsonl");
        let w = JsonLinesWriter::new(Some(path.clone()), false, false, false).unwrap();
        w.write(&sample_row()).unwrap();
        w.close().unwrap();

        let mut contents = String::new();
        std::fs::File::open(&path).unwrap().read_to_string(&mut contents).unwrap();
        let v: serde_json::Value = serde_json::from_str(contents.trim()).unwrap();
        assert_eq!(v["rtype"], "A");
        assert_eq!(v["data"], "93.184.216.34");
        let _ = std::fs::remove_file(&path);
    }
}
