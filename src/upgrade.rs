//! Upgraded byte streams.
//!
//! When a server answers `101 Switching Protocols` to an upgrade request,
//! the connection stops being HTTP: the client detaches the socket and hands
//! it to the request's handler as an [`Upgraded`] stream. Any bytes the
//! client had already read past the response head are replayed first, so the
//! new protocol sees the stream exactly where the server left it.

use std::any::TypeId;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::common::rewind::Rewind;

/// An upgraded connection.
///
/// Holds the raw io object the client was using, type erased. It can be used
/// directly as [`AsyncRead`]/[`AsyncWrite`], or, if the concrete type is
/// known, deconstructed with [`Upgraded::downcast`].
pub struct Upgraded {
    io: Rewind<Box<dyn Io + Send>>,
}

/// The deconstructed parts of an [`Upgraded`] stream.
#[derive(Debug)]
#[non_exhaustive]
pub struct Parts<T> {
    /// The original io object used before the upgrade.
    pub io: T,
    /// Bytes that were read but not processed as HTTP.
    ///
    /// If the server began speaking the new protocol in the same packets as
    /// its `101` response, those bytes end up here. Check this buffer before
    /// reading from the io object.
    pub read_buf: Bytes,
}

// ===== impl Upgraded =====

impl Upgraded {
    #[cfg(test)]
    pub(crate) fn new<T>(io: T, read_buf: Bytes) -> Self
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Upgraded {
            io: Rewind::new_buffered(Box::new(io), read_buf),
        }
    }

    pub(crate) fn from_boxed(io: Box<dyn Io + Send>, read_buf: Bytes) -> Self {
        Upgraded {
            io: Rewind::new_buffered(io, read_buf),
        }
    }

    /// Tries to deconstruct into the concrete io type and leftover bytes.
    pub fn downcast<T: AsyncRead + AsyncWrite + Unpin + 'static>(self) -> Result<Parts<T>, Self> {
        let (io, buf) = self.io.into_inner();
        match io.__elva_downcast() {
            Ok(t) => Ok(Parts {
                io: *t,
                read_buf: buf,
            }),
            Err(io) => Err(Upgraded {
                io: Rewind::new_buffered(io, buf),
            }),
        }
    }
}

impl AsyncRead for Upgraded {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for Upgraded {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write_vectored(cx, bufs)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }

    fn is_write_vectored(&self) -> bool {
        self.io.is_write_vectored()
    }
}

impl fmt::Debug for Upgraded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Upgraded").finish()
    }
}

// ===== impl Io =====

pub(crate) trait Io: AsyncRead + AsyncWrite + Unpin + 'static {
    fn __elva_type_id(&self) -> TypeId {
        TypeId::of::<Self>()
    }
}

impl<T: AsyncRead + AsyncWrite + Unpin + 'static> Io for T {}

impl dyn Io + Send {
    fn __elva_is<T: Io>(&self) -> bool {
        let t = TypeId::of::<T>();
        self.__elva_type_id() == t
    }

    fn __elva_downcast<T: Io>(self: Box<Self>) -> Result<Box<T>, Box<Self>> {
        if self.__elva_is::<T>() {
            // Taken from `std::error::Error::downcast()`.
            unsafe {
                let raw: *mut dyn Io = Box::into_raw(self);
                Ok(Box::from_raw(raw as *mut T))
            }
        } else {
            Err(self)
        }
    }
}
