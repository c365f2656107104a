use std::{
    fs::File,
    io::{BufRead, BufReader, Seek, SeekFrom},
};

use crate::error::Result;
use crate::split::Split;

/// Lee los registros de línea de un split.
///
/// - clave: offset en bytes (decimal) del inicio de la línea en el recurso
/// - valor: la línea sin `\n` / `\r\n`
///
/// Un split que no empieza en 0 descarta su primera línea (la lee el split
/// anterior), y cada split lee toda línea que empiece en `<= end`. Así cada
/// línea pertenece exactamente a un split.
pub struct LineRecordReader {
    reader: BufReader<File>,
    pos: u64,
    end: u64,
    buf: Vec<u8>,
}

impl LineRecordReader {
    pub fn open(split: &Split) -> Result<Self> {
        let mut file = File::open(&split.resource)?;
        file.seek(SeekFrom::Start(split.offset))?;
        let mut reader = BufReader::new(file);
        let mut pos = split.offset;

        if split.offset != 0 {
            let mut skipped = Vec::new();
            pos += reader.read_until(b'\n', &mut skipped)? as u64;
        }

        Ok(Self {
            reader,
            pos,
            end: split.end(),
            buf: Vec::new(),
        })
    }

    /// Siguiente `(offset, línea)` o `None` al terminar el split.
    pub fn next_record(&mut self) -> Result<Option<(u64, Vec<u8>)>> {
        if self.pos > self.end {
            return Ok(None);
        }

        self.buf.clear();
        let read = self.reader.read_until(b'\n', &mut self.buf)?;
        if read == 0 {
            return Ok(None);
        }

        let start = self.pos;
        self.pos += read as u64;

        if self.buf.last() == Some(&b'\n') {
            self.buf.pop();
            if self.buf.last() == Some(&b'\r') {
                self.buf.pop();
            }
        }

        Ok(Some((start, std::mem::take(&mut self.buf))))
    }
}

impl Iterator for LineRecordReader {
    type Item = Result<(u64, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}
