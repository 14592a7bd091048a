use core::{
    pin::Pin,
    task::{Context, Poll, ready},
};
use std::io::{ErrorKind, Read, Write};

use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::{config::EndpointType, pipeline::Pipeline, stage::Stage};

pin_project! {
    /// Asynchronous staged stream based on `Tokio` runtime.
    ///
    /// [`StagedStream`] implements the [`AsyncRead`] and [`AsyncWrite`] traits,
    /// allowing it to be used similarly to a [`TcpStream`].
    ///
    /// [`TcpStream`]: tokio::net::TcpStream
    #[derive(Debug)]
    pub struct StagedStream<IO> {
        stream: IO,
        pipeline: Pipeline,
    }
}

impl<IO> StagedStream<IO> {
    /// Runs the configured `stage` as `side` over `stream`, without a
    /// cipher.
    pub fn new(stage: Box<dyn Stage>, side: EndpointType, stream: IO) -> Self {
        Self::with_pipeline(Pipeline::new(stage, side), stream)
    }

    /// Runs an existing [`Pipeline`] over `stream`.
    pub fn with_pipeline(pipeline: Pipeline, stream: IO) -> Self {
        Self { stream, pipeline }
    }

    /// Returns a reference to the pipeline.
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Returns a reference to the internal stream.
    pub fn inner_stream(&self) -> &IO {
        &self.stream
    }

    /// Returns a mutable reference to the inner stream.
    pub fn inner_stream_mut(&mut self) -> &mut IO {
        &mut self.stream
    }
}

impl<IO> AsyncRead for StagedStream<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let me = self.project();
        loop {
            if me.pipeline.plaintext_len() > 0 {
                let n = me.pipeline.read_plaintext(buf.initialize_unfilled());
                buf.advance(n);
                return Poll::Ready(Ok(()));
            }

            // Server feedback queued by the last read.
            if me.pipeline.wants_write() {
                let mut writer = SyncWriteAdapter {
                    io: &mut *me.stream,
                    cx,
                };
                match me.pipeline.write_wire(&mut writer) {
                    Ok(_) => {}
                    Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                    Err(e) => return Poll::Ready(Err(e)),
                }
            }

            let mut reader = SyncReadAdapter {
                io: &mut *me.stream,
                cx,
            };
            match me.pipeline.read_wire(&mut reader) {
                // Reached EOF.
                Ok(0) => return Poll::Ready(Ok(())),

                // Frames may still be incomplete, read again.
                Ok(_) => continue,

                Err(e) if e.kind() == ErrorKind::WouldBlock => return Poll::Pending,

                // I/O error or a stage error wrapped in `ErrorKind::Other`.
                Err(e) => return Poll::Ready(Err(e)),
            }
        }
    }
}

impl<IO> AsyncWrite for StagedStream<IO>
where
    IO: AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        let me = self.project();
        let mut writer = SyncWriteAdapter {
            io: &mut *me.stream,
            cx,
        };

        // Drain what an earlier call left behind before taking more.
        if me.pipeline.wants_write() {
            match me.pipeline.write_wire(&mut writer) {
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Poll::Pending,
                Err(e) => return Poll::Ready(Err(e)),
            }
        }

        me.pipeline.write_plaintext(buf);
        match me.pipeline.write_wire(&mut writer) {
            Ok(_) => {}
            // The rest is written by the next write or flush.
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => return Poll::Ready(Err(e)),
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        let me = self.project();
        if me.pipeline.wants_write() {
            let mut writer = SyncWriteAdapter {
                io: &mut *me.stream,
                cx,
            };
            match me.pipeline.write_wire(&mut writer) {
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Poll::Pending,
                Err(e) => return Poll::Ready(Err(e)),
            }
        }
        Pin::new(me.stream).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        ready!(self.as_mut().poll_flush(cx))?;
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

/// An adapter that implements a [`Read`] interface for [`AsyncRead`] types and an
/// associated [`Context`].
///
/// Turns `Poll::Pending` into `WouldBlock`.
///
/// The credit goes to the [futures-rustls](https://github.com/rustls/futures-rustls)
/// project for this adapter.
struct SyncReadAdapter<'a, 'b, T> {
    io: &'a mut T,
    cx: &'a mut Context<'b>,
}

impl<T: AsyncRead + Unpin> Read for SyncReadAdapter<'_, '_, T> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut buf = ReadBuf::new(buf);
        match Pin::new(&mut *self.io).poll_read(self.cx, &mut buf) {
            Poll::Ready(Ok(())) => Ok(buf.filled().len()),
            Poll::Ready(Err(err)) => Err(err),
            Poll::Pending => Err(ErrorKind::WouldBlock.into()),
        }
    }
}

/// An adapter that implements a [`Write`] interface for [`AsyncWrite`] types and an
/// associated [`Context`].
///
/// Turns `Poll::Pending` into `WouldBlock`.
struct SyncWriteAdapter<'a, 'b, T> {
    io: &'a mut T,
    cx: &'a mut Context<'b>,
}

impl<T: AsyncWrite + Unpin> Write for SyncWriteAdapter<'_, '_, T> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match Pin::new(&mut *self.io).poll_write(self.cx, buf) {
            Poll::Ready(result) => result,
            Poll::Pending => Err(ErrorKind::WouldBlock.into()),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match Pin::new(&mut *self.io).poll_flush(self.cx) {
            Poll::Ready(result) => result,
            Poll::Pending => Err(ErrorKind::WouldBlock.into()),
        }
    }
}
