use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};

use crate::beanstalk::ByteStream;

#[derive(Clone, Debug)]
pub enum ScriptStep {
    Data(Vec<u8>),
    WouldBlock,
}

/// Stream double that replays scripted reads and records writes. Running out
/// of script reads as EOF.
#[derive(Clone, Default)]
pub struct ScriptedStream {
    steps: Arc<Mutex<VecDeque<ScriptStep>>>,
    written: Arc<Mutex<Vec<u8>>>,
}

impl ScriptedStream {
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self {
            steps: Arc::new(Mutex::new(steps.into())),
            written: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn written(&self) -> Vec<u8> {
        self.written.lock().expect("scripted stream lock poisoned").clone()
    }
}

impl Read for ScriptedStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut steps = self.steps.lock().expect("scripted stream lock poisoned");
        match steps.pop_front() {
            Some(ScriptStep::Data(bytes)) => {
                let size = bytes.len().min(buf.len());
                buf[..size].copy_from_slice(&bytes[..size]);
                if size < bytes.len() {
                    steps.push_front(ScriptStep::Data(bytes[size..].to_vec()));
                }
                Ok(size)
            }
            Some(ScriptStep::WouldBlock) => Err(io::Error::from(io::ErrorKind::WouldBlock)),
            None => Ok(0),
        }
    }
}

impl Write for ScriptedStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.written
            .lock()
            .expect("scripted stream lock poisoned")
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl ByteStream for ScriptedStream {}
