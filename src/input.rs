use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read};
use std::path::Path;

use anyhow::{Context, Result};
use avformat::io::{IoReader, IoWriter};

/// Opens an input path as a byte stream.
///
/// `-` reads standard input to its end first, so the demuxers can seek in it.
pub fn open_input<P: AsRef<Path>>(input_path: P) -> Result<IoReader> {
    let path = input_path.as_ref();
    if is_pipe(path) {
        let mut data = Vec::new();
        io::stdin().lock().read_to_end(&mut data)?;
        log::debug!("read {} bytes from stdin", data.len());
        return Ok(IoReader::from_bytes(data));
    }

    let file = File::open(path).with_context(|| format!("cannot open {}", path.display()))?;
    Ok(IoReader::new(BufReader::new(file))?)
}

/// Opens an output path. `-` writes to standard output without seeking.
pub fn open_output<P: AsRef<Path>>(output_path: P) -> Result<IoWriter> {
    let path = output_path.as_ref();
    if is_pipe(path) {
        return Ok(IoWriter::stream(io::stdout()));
    }

    let file = File::create(path).with_context(|| format!("cannot create {}", path.display()))?;
    Ok(IoWriter::seekable(BufWriter::new(file))?)
}

pub fn is_pipe(path: &Path) -> bool {
    path.as_os_str() == "-"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dash_is_a_pipe() {
        assert!(is_pipe(Path::new("-")));
        assert!(!is_pipe(Path::new("./-")));
        assert!(!is_pipe(Path::new("in.mp4")));
    }

    #[test]
    fn missing_file_names_the_path() {
        let err = open_input("/nonexistent/input.flv").err().map(|e| e.to_string());
        assert_eq!(err.as_deref(), Some("cannot open /nonexistent/input.flv"));
    }
}
