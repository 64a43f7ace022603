pub mod bulk;
pub mod channels;
pub mod dispatcher;
pub mod init;
pub mod request;
