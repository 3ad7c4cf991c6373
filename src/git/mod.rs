mod workspace;

pub use workspace::GitWorkspace;
