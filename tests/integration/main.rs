mod common;

mod config_invalid_certificates;
mod config_invalid_options;
mod health_check_local_proxy;
mod http_redirect_to_https;
mod https_forward_raw_tcp;
mod https_virtual_hosts;
