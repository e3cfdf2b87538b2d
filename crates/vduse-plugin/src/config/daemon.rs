use std::path::PathBuf;

use clap::Parser;

use crate::plugin::DEFAULT_PLUGIN_DIR;

/// Default directory CDI specs are published to.
pub const DEFAULT_CDI_SPEC_DIR: &str = "/var/run/cdi";

/// Default directory device-info files are written to.
pub const DEFAULT_DEVICE_INFO_DIR: &str = "/var/run/k8s.cni.cncf.io/devinfo/dp";

#[derive(Parser, Clone, Debug)]
pub struct DaemonArgs {
    #[arg(
        long,
        env = "VDUSE_NUM_DEVICES",
        default_value_t = 20,
        help = "Number of VDUSE devices to provision and advertise"
    )]
    pub num_devices: usize,

    #[arg(
        long,
        env = "VDUSE_RESOURCE_PREFIX",
        default_value = "vduse.io",
        help = "Resource namespace prefix, e.g. vduse.io"
    )]
    pub resource_prefix: String,

    #[arg(
        long,
        env = "VDUSE_RESOURCE_KIND",
        default_value = "vduse",
        help = "Resource kind; device names derive from it, e.g. vduse0"
    )]
    pub resource_kind: String,

    #[arg(
        long,
        env = "VDUSE_POOL_NAME",
        default_value = "default",
        help = "Pool name, part of the published CDI spec identity"
    )]
    pub pool_name: String,

    #[arg(
        long,
        default_value_t = false,
        action = clap::ArgAction::Set,
        help = "Hand devices out as CDI annotations instead of device node grants"
    )]
    pub cdi: bool,

    #[arg(
        long,
        env = "CDI_SPEC_DIR",
        value_hint = clap::ValueHint::DirPath,
        default_value = DEFAULT_CDI_SPEC_DIR,
        help = "Directory the CDI spec is published to"
    )]
    pub cdi_spec_dir: PathBuf,

    #[arg(
        long,
        env = "DEVICE_INFO_DIR",
        value_hint = clap::ValueHint::DirPath,
        default_value = DEFAULT_DEVICE_INFO_DIR,
        help = "Directory device-info files are written to"
    )]
    pub device_info_dir: PathBuf,

    #[arg(
        long,
        env = "KUBELET_PLUGIN_DIR",
        value_hint = clap::ValueHint::DirPath,
        default_value = DEFAULT_PLUGIN_DIR,
        help = "Kubelet plugin registry directory the socket is bound in"
    )]
    pub plugin_dir: PathBuf,

    #[arg(
        long,
        default_value_t = 10,
        help = "Seconds between inventory polls feeding the watch stream"
    )]
    pub update_interval: u64,
}

#[derive(Parser, Clone, Debug)]
pub struct CleanupArgs {
    #[arg(
        long,
        env = "VDUSE_NUM_DEVICES",
        default_value_t = 20,
        help = "Number of device names to attempt to tear down"
    )]
    pub num_devices: usize,

    #[arg(long, env = "VDUSE_RESOURCE_PREFIX", default_value = "vduse.io")]
    pub resource_prefix: String,

    #[arg(long, env = "VDUSE_RESOURCE_KIND", default_value = "vduse")]
    pub resource_kind: String,

    #[arg(long, env = "VDUSE_POOL_NAME", default_value = "default")]
    pub pool_name: String,

    #[arg(
        long,
        env = "CDI_SPEC_DIR",
        value_hint = clap::ValueHint::DirPath,
        default_value = DEFAULT_CDI_SPEC_DIR
    )]
    pub cdi_spec_dir: PathBuf,

    #[arg(
        long,
        env = "DEVICE_INFO_DIR",
        value_hint = clap::ValueHint::DirPath,
        default_value = DEFAULT_DEVICE_INFO_DIR
    )]
    pub device_info_dir: PathBuf,
}
