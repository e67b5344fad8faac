use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to open kernel shim device {path}: {source}")]
    OpenShim {
        path: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("ioctl {name} on kernel shim failed: {source}")]
    Ioctl {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("mmap of the bridge page failed: {0}")]
    Mmap(std::io::Error),
    #[error("sigprocmask/sigwait setup failed: {0}")]
    Signal(std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
