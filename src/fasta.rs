use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use flate2::read::MultiGzDecoder;

use crate::errors::Result;
use crate::types::FastaRecord;

/// Minimal FASTA read function that also supports .gz
pub fn read_fasta_records<P: AsRef<Path>>(path: P) -> Result<Vec<FastaRecord>> {
    let path = path.as_ref();
    let f = File::open(path)?;

    // If the file ends with ".gz", wrap it in a MultiGzDecoder
    let is_gz = path
        .extension()
        .map(|ext| ext == "gz")
        .unwrap_or(false);

    let reader: Box<dyn BufRead> = if is_gz {
        Box::new(BufReader::new(MultiGzDecoder::new(f)))
    } else {
        Box::new(BufReader::new(f))
    };

    read_fasta_from(reader)
}

/// Parses FASTA records from any buffered reader. Sequence lines may be
/// wrapped; they are concatenated and uppercased. Lines before the first
/// '>' are ignored.
pub fn read_fasta_from<R: BufRead>(reader: R) -> Result<Vec<FastaRecord>> {
    let mut records = Vec::new();
    let mut label: Option<String> = None;
    let mut seq = String::new();

    for line in reader.lines() {
        let line = line?;
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = line.strip_prefix('>') {
            if let Some(lbl) = label.take() {
                records.push(FastaRecord::new(lbl, std::mem::take(&mut seq)));
            }
            label = Some(rest.trim().to_string());
        } else if label.is_some() {
            seq.push_str(&line.to_ascii_uppercase());
        }
    }
    if let Some(lbl) = label {
        records.push(FastaRecord::new(lbl, seq));
    }

    Ok(records)
}

/// Writes records as single-line FASTA.
pub fn write_fasta_records<P: AsRef<Path>>(path: P, records: &[FastaRecord]) -> Result<()> {
    let f = File::create(path)?;
    let mut w = BufWriter::new(f);
    for rec in records {
        writeln!(w, ">{}", rec.label)?;
        writeln!(w, "{}", rec.sequence)?;
    }
    w.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_parse_simple_fasta() {
        let input = ">s1_0\nACGT\n>s1_1\nTTGA\n";
        let recs = read_fasta_from(Cursor::new(input)).unwrap();
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0], FastaRecord::new("s1_0", "ACGT"));
        assert_eq!(recs[1], FastaRecord::new("s1_1", "TTGA"));
    }

    #[test]
    fn test_parse_wrapped_and_lowercase() {
        let input = ">r1\nacgt\nACGT\n";
        let recs = read_fasta_from(Cursor::new(input)).unwrap();
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].sequence, "ACGTACGT");
    }

    #[test]
    fn test_parse_skips_leading_junk_and_blank_lines() {
        let input = "; comment\n\n>r1\nACGT\n\n>r2\nGGGG\n";
        let recs = read_fasta_from(Cursor::new(input)).unwrap();
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[1].sequence, "GGGG");
    }

    #[test]
    fn test_write_then_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seqs.fa");
        let recs = vec![
            FastaRecord::new("sampleA_0", "ACGTACGT"),
            FastaRecord::new("sampleB_1", "TTTTAAAA"),
        ];
        write_fasta_records(&path, &recs).unwrap();
        let back = read_fasta_records(&path).unwrap();
        assert_eq!(back, recs);
    }

    #[test]
    fn test_parse_empty_input() {
        let recs = read_fasta_from(Cursor::new("")).unwrap();
        assert!(recs.is_empty());
    }
}
