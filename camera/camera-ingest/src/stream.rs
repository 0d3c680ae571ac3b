//! Decoder and segmenter subprocess handles.
//!
//! The control half (child processes) lives behind a lock in the camera so
//! restarts and shutdown can kill the pipe from any thread, while the reader
//! thread owns the stdout handle it blocks on. Killing the decoder makes the
//! reader's blocking read return, which is exactly how shutdown interrupts
//! it.

use std::io::Read;
use std::process::{Child, ChildStdout, Command, Stdio};

use tracing::{debug, error};

/// Read exactly one frame's worth of bytes. `None` on EOF, short read, or
/// error.
pub fn read_exact_frame(reader: &mut impl Read, size: usize) -> Option<Vec<u8>> {
    let mut buffer = vec![0u8; size];
    match reader.read_exact(&mut buffer) {
        Ok(()) => Some(buffer),
        Err(_) => None,
    }
}

/// A camera's decoder process plus, when a substream is configured, its
/// dedicated segmenter process.
pub struct Stream {
    program: String,
    decoder_args: Vec<String>,
    segmenter_args: Option<Vec<String>>,
    /// Credential string to mask out of logged command lines.
    sensitive: Option<String>,
    decoder: Option<Child>,
    segmenter: Option<Child>,
}

impl Stream {
    pub fn new(
        program: String,
        decoder_args: Vec<String>,
        segmenter_args: Option<Vec<String>>,
        sensitive: Option<String>,
    ) -> Self {
        Stream {
            program,
            decoder_args,
            segmenter_args,
            sensitive,
            decoder: None,
            segmenter: None,
        }
    }

    fn masked(&self, args: &[String]) -> String {
        let joined = args.join(" ");
        match &self.sensitive {
            Some(secret) if !secret.is_empty() => joined.replace(secret.as_str(), "********"),
            _ => joined,
        }
    }

    /// Launch the decoder (and segmenter, if it is not already running).
    /// Returns the decoder's stdout for the reader thread.
    pub fn start_pipe(&mut self) -> std::io::Result<ChildStdout> {
        if let Some(segmenter_args) = &self.segmenter_args {
            let running = matches!(
                self.segmenter.as_mut().map(|c| c.try_wait()),
                Some(Ok(None))
            );
            if !running {
                debug!(
                    "segmenter command: {} {}",
                    self.program,
                    self.masked(segmenter_args)
                );
                self.segmenter = Some(
                    Command::new(&self.program)
                        .args(segmenter_args)
                        .stdout(Stdio::null())
                        .stderr(Stdio::inherit())
                        .spawn()?,
                );
            }
        }
        debug!(
            "decoder command: {} {}",
            self.program,
            self.masked(&self.decoder_args)
        );
        let mut decoder = Command::new(&self.program)
            .args(&self.decoder_args)
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;
        let stdout = decoder.stdout.take().expect("piped stdout");
        self.decoder = Some(decoder);
        Ok(stdout)
    }

    /// Exit status of the decoder, if it has exited.
    pub fn poll(&mut self) -> Option<std::process::ExitStatus> {
        self.decoder.as_mut()?.try_wait().ok().flatten()
    }

    pub fn decoder_alive(&mut self) -> bool {
        match self.decoder.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    pub fn segmenter_alive(&mut self) -> bool {
        match self.segmenter.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Kill and reap the decoder; the segmenter keeps running so segments
    /// are not interrupted by decoder restarts.
    pub fn close_decoder(&mut self) {
        if let Some(mut child) = self.decoder.take() {
            if let Err(e) = child.kill() {
                error!("could not kill decoder: {e}");
            }
            let _ = child.wait();
        }
    }

    /// Kill everything, segmenter included.
    pub fn close_all(&mut self) {
        self.close_decoder();
        if let Some(mut child) = self.segmenter.take() {
            if let Err(e) = child.kill() {
                error!("could not kill segmenter: {e}");
            }
            let _ = child.wait();
        }
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn exact_frame_reads() {
        let mut reader = Cursor::new(vec![1u8; 10]);
        let frame = read_exact_frame(&mut reader, 4).unwrap();
        assert_eq!(frame.len(), 4);
        let frame = read_exact_frame(&mut reader, 4).unwrap();
        assert_eq!(frame.len(), 4);
        // Only 2 bytes left: short read.
        assert!(read_exact_frame(&mut reader, 4).is_none());
    }

    #[test]
    fn pipe_reads_frames_until_decoder_exits() {
        // Stand-in decoder emitting two 6-byte frames.
        let mut stream = Stream::new(
            "sh".to_string(),
            vec!["-c".to_string(), "printf 'aaaaaabbbbbb'".to_string()],
            None,
            None,
        );
        let mut stdout = stream.start_pipe().unwrap();
        assert_eq!(read_exact_frame(&mut stdout, 6).unwrap(), b"aaaaaa");
        assert_eq!(read_exact_frame(&mut stdout, 6).unwrap(), b"bbbbbb");
        assert!(read_exact_frame(&mut stdout, 6).is_none());
        stream.close_all();
        assert!(!stream.decoder_alive());
    }

    #[test]
    fn killing_the_decoder_unblocks_a_reader() {
        // A decoder that never writes; the reader must return once the
        // process is killed.
        let mut stream = Stream::new(
            "sh".to_string(),
            vec!["-c".to_string(), "sleep 60".to_string()],
            None,
            None,
        );
        let mut stdout = stream.start_pipe().unwrap();
        let reader = std::thread::spawn(move || read_exact_frame(&mut stdout, 6));
        std::thread::sleep(std::time::Duration::from_millis(100));
        stream.close_all();
        assert!(reader.join().unwrap().is_none());
    }
}
