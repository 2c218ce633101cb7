//! Lima + k3s shell scripts
//!
//! Every create plan starts by force-deleting the VM it is about to
//! create, which is what makes re-running a task safe. Progress goes to
//! stderr; stdout carries only the final JSON payload.

use crate::config::ProvisionSettings;
use crate::probe::ReadinessProbe;
use crate::secrets::{JoinInfo, SecretBundle};
use crate::state::NodeDescriptor;
use crate::task::{CreatePlan, HostProvisioner};
use k3sforge_common::{ClusterSpec, HostSpec, NodeRole};

const HEREDOC_MARKER: &str = "K3SFORGE_LIMA_EOF";
const NODE_TOKEN_PATH: &str = "/var/lib/rancher/k3s/server/node-token";
const K3S_KUBECONFIG_PATH: &str = "/etc/rancher/k3s/k3s.yaml";

/// Quote a value for POSIX shells
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Renders scripts from provisioning settings
#[derive(Debug, Clone)]
pub struct ScriptRenderer {
    settings: ProvisionSettings,
}

impl ScriptRenderer {
    pub fn new(settings: ProvisionSettings) -> Self {
        Self { settings }
    }

    fn limactl(&self) -> String {
        shell_quote(&format!("{}/limactl", self.settings.brew_bin_path))
    }

    fn jq(&self) -> String {
        shell_quote(&format!("{}/jq", self.settings.brew_bin_path))
    }

    /// Lima instance config; the master forwards the k3s API port to the host
    pub fn lima_config(&self, role: NodeRole) -> String {
        let mut config = format!(
            r#"vmType: "{vm_type}"
images:
- location: "{image}"
  arch: "{arch}"
mounts:
- location: "~"
- location: "/tmp/lima"
  writable: true
"#,
            vm_type = self.settings.vm_type,
            image = self.settings.image_url,
            arch = self.settings.image_arch,
        );

        if role == NodeRole::Master {
            config.push_str(&format!(
                r#"portForwards:
- guestPort: {port}
  hostIP: "0.0.0.0"
  hostPort: {port}
"#,
                port = self.settings.api_port
            ));
        }

        config
    }

    /// Delete any old VM and start a fresh one
    fn prepare_script(&self, role: NodeRole, vm: &str) -> String {
        let limactl = self.limactl();
        let config_path = format!("/tmp/{}.yaml", vm);
        let mut script = format!(
            "set -e\n\
             echo \"Deleting old instance {vm}...\" >&2\n\
             {limactl} delete -f {vm_q} > /dev/null 2>&1 || true\n",
            vm = vm,
            vm_q = shell_quote(vm),
            limactl = limactl,
        );

        if self.settings.clear_image_cache {
            script.push_str(&format!(
                "echo \"Clearing Lima image cache...\" >&2\n\
                 {limactl} cache delete > /dev/null 2>&1 || true\n",
                limactl = limactl
            ));
        }

        script.push_str(&format!(
            "echo \"Writing Lima config for {vm}...\" >&2\n\
             cat > {path} <<'{marker}'\n{config}{marker}\n\
             echo \"Starting {vm}...\" >&2\n\
             {limactl} start --tty=false --name={vm_q} {path} > /dev/null\n",
            vm = vm,
            vm_q = shell_quote(vm),
            path = shell_quote(&config_path),
            marker = HEREDOC_MARKER,
            config = self.lima_config(role),
            limactl = limactl,
        ));

        script
    }

    /// Exits 0 once the VM accepts shell commands, 1 otherwise
    fn vm_ready_check(&self, vm: &str) -> String {
        format!(
            "{} shell {} echo ready > /dev/null 2>&1 || exit 1",
            self.limactl(),
            shell_quote(vm)
        )
    }

    /// Run `command` inside the VM, dumping `log` to stderr if it fails
    fn in_vm(&self, vm: &str, command: &str, log: &str) -> String {
        let limactl = self.limactl();
        format!(
            "set -e\n\
             if ! {limactl} shell {vm} -- bash -c {cmd}; then\n\
             \x20 {limactl} shell {vm} -- cat {log} >&2 || true\n\
             \x20 exit 1\n\
             fi\n",
            limactl = limactl,
            vm = shell_quote(vm),
            cmd = shell_quote(&format!("{} > {} 2>&1", command, log)),
            log = shell_quote(log),
        )
    }

    /// Install the k3s server inside the master VM
    pub fn k3s_server_command(&self, master_address: &str) -> String {
        format!(
            "curl -sfL https://get.k3s.io | sh -s - server --tls-san {} --flannel-backend={}",
            shell_quote(master_address),
            shell_quote(&self.settings.flannel_backend)
        )
    }

    /// Install the k3s agent inside a worker VM
    pub fn k3s_agent_command(&self, join: &JoinInfo) -> String {
        format!(
            "curl -sfL https://get.k3s.io | K3S_URL={} K3S_TOKEN={} sh -s -",
            shell_quote(&format!(
                "https://{}:{}",
                join.master_ip, self.settings.api_port
            )),
            shell_quote(join.token.expose())
        )
    }

    fn secrets_ready_check(&self, vm: &str) -> String {
        let limactl = self.limactl();
        let vm = shell_quote(vm);
        format!(
            "{limactl} shell {vm} sudo test -f {token} && {limactl} shell {vm} sudo test -f {kubeconfig} || exit 1",
            limactl = limactl,
            vm = vm,
            token = NODE_TOKEN_PATH,
            kubeconfig = K3S_KUBECONFIG_PATH,
        )
    }

    /// Print `{"ip", "token", "kubeconfig"}` with the kubeconfig pointed at the master address
    fn extract_script(&self, vm: &str, master_address: &str) -> String {
        let limactl = self.limactl();
        format!(
            "set -e\n\
             MASTER_IP={ip}\n\
             TOKEN=$({limactl} shell {vm} sudo cat {token})\n\
             KUBECONFIG_DATA=$({limactl} shell {vm} sudo cat {kubeconfig} | sed \"s/127\\.0\\.0\\.1/${{MASTER_IP}}/g\")\n\
             {jq} -n --arg ip \"$MASTER_IP\" --arg token \"$TOKEN\" --arg kubeconfig \"$KUBECONFIG_DATA\" \
             '{{ip: $ip, token: $token, kubeconfig: $kubeconfig}}'\n",
            ip = shell_quote(master_address),
            limactl = limactl,
            vm = shell_quote(vm),
            token = NODE_TOKEN_PATH,
            kubeconfig = K3S_KUBECONFIG_PATH,
            jq = self.jq(),
        )
    }

    /// Print `{"ip"}` with the worker VM's address
    fn report_script(&self, vm: &str) -> String {
        let limactl = self.limactl();
        let jq = self.jq();
        format!(
            "set -e\n\
             INTERNAL_IP=$({limactl} list {vm} --json | {jq} -r .address)\n\
             if [ -z \"$INTERNAL_IP\" ] || [ \"$INTERNAL_IP\" = \"null\" ]; then\n\
             \x20 echo \"Error: no address reported for {vm_plain}\" >&2\n\
             \x20 exit 1\n\
             fi\n\
             {jq} -n --arg ip \"$INTERNAL_IP\" '{{ip: $ip}}'\n",
            limactl = limactl,
            jq = jq,
            vm = shell_quote(vm),
            vm_plain = vm,
        )
    }

    pub fn delete_script(&self, vm: &str) -> String {
        format!("{} delete -f {}", self.limactl(), shell_quote(vm))
    }

    fn vm_boot_probe(&self) -> ReadinessProbe {
        self.settings.vm_boot
    }

    fn secrets_probe(&self) -> ReadinessProbe {
        self.settings.k3s_secrets
    }
}

/// Creates the k3s server VM and extracts the join token and kubeconfig
#[derive(Debug, Clone)]
pub struct MasterProvisioner {
    renderer: ScriptRenderer,
    address: String,
    vm: String,
}

impl MasterProvisioner {
    pub fn new(renderer: ScriptRenderer, host: &HostSpec) -> Self {
        Self {
            renderer,
            address: host.address.clone(),
            vm: ClusterSpec::vm_name(NodeRole::Master, host),
        }
    }
}

impl HostProvisioner for MasterProvisioner {
    type Input = ();
    type Output = SecretBundle;

    fn create_plan(&self, _input: &()) -> CreatePlan {
        let r = &self.renderer;
        CreatePlan::new()
            .run("prepare", r.prepare_script(NodeRole::Master, &self.vm))
            .await_ready("vm-ready", r.vm_ready_check(&self.vm), r.vm_boot_probe())
            .run(
                "install",
                r.in_vm(
                    &self.vm,
                    &r.k3s_server_command(&self.address),
                    "/tmp/k3s-install.log",
                ),
            )
            .await_ready("secrets-ready", r.secrets_ready_check(&self.vm), r.secrets_probe())
            .run("extract", r.extract_script(&self.vm, &self.address))
    }

    fn delete_script(&self) -> String {
        self.renderer.delete_script(&self.vm)
    }

    fn resource_name(&self) -> String {
        self.vm.clone()
    }
}

/// Creates a worker VM and joins it to the master
#[derive(Debug, Clone)]
pub struct WorkerProvisioner {
    renderer: ScriptRenderer,
    vm: String,
}

impl WorkerProvisioner {
    pub fn new(renderer: ScriptRenderer, host: &HostSpec) -> Self {
        Self {
            renderer,
            vm: ClusterSpec::vm_name(NodeRole::Worker, host),
        }
    }
}

impl HostProvisioner for WorkerProvisioner {
    type Input = JoinInfo;
    type Output = NodeDescriptor;

    fn create_plan(&self, join: &JoinInfo) -> CreatePlan {
        let r = &self.renderer;
        CreatePlan::new()
            .run("prepare", r.prepare_script(NodeRole::Worker, &self.vm))
            .await_ready("vm-ready", r.vm_ready_check(&self.vm), r.vm_boot_probe())
            .run(
                "join",
                r.in_vm(&self.vm, &r.k3s_agent_command(join), "/tmp/k3s-join.log"),
            )
            .run("report", r.report_script(&self.vm))
    }

    fn delete_script(&self) -> String {
        self.renderer.delete_script(&self.vm)
    }

    fn resource_name(&self) -> String {
        self.vm.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Step;
    use k3sforge_common::Secret;

    fn renderer() -> ScriptRenderer {
        ScriptRenderer::new(ProvisionSettings::default())
    }

    fn script_of<'a>(plan: &'a CreatePlan, label: &str) -> &'a str {
        plan.steps()
            .iter()
            .find_map(|s| match s {
                Step::Run { label: l, script } if l == label => Some(script.as_str()),
                Step::Await { label: l, check, .. } if l == label => Some(check.as_str()),
                _ => None,
            })
            .unwrap()
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("abc"), "'abc'");
        assert_eq!(shell_quote("a'b"), r"'a'\''b'");
    }

    #[test]
    fn test_lima_config_port_forward_only_on_master() {
        let r = renderer();
        assert!(r.lima_config(NodeRole::Master).contains("guestPort: 6443"));
        assert!(!r.lima_config(NodeRole::Worker).contains("portForwards"));
        assert!(r.lima_config(NodeRole::Worker).contains("arch: \"aarch64\""));
    }

    #[test]
    fn test_master_plan_shape() {
        let master = MasterProvisioner::new(renderer(), &HostSpec::new("mac1", "10.0.0.1"));
        let plan = master.create_plan(&());

        let labels: Vec<&str> = plan.steps().iter().map(Step::label).collect();
        assert_eq!(
            labels,
            vec!["prepare", "vm-ready", "install", "secrets-ready", "extract"]
        );

        let prepare = script_of(&plan, "prepare");
        let delete_at = prepare.find("delete -f 'k3s-master'").unwrap();
        let start_at = prepare.find("start --tty=false").unwrap();
        assert!(delete_at < start_at);

        assert!(script_of(&plan, "install").contains("--tls-san '\\''10.0.0.1'\\''"));
        assert!(script_of(&plan, "extract").contains("MASTER_IP='10.0.0.1'"));
        assert_eq!(
            master.delete_script(),
            "'/opt/homebrew/bin/limactl' delete -f 'k3s-master'"
        );
    }

    #[test]
    fn test_worker_plan_embeds_join_info() {
        let worker = WorkerProvisioner::new(renderer(), &HostSpec::new("Mac2", "10.0.0.2"));
        let join = JoinInfo {
            master_ip: "10.0.0.1".to_string(),
            token: Secret::new("K10abc::server:xyz".to_string()),
        };
        let plan = worker.create_plan(&join);

        let labels: Vec<&str> = plan.steps().iter().map(Step::label).collect();
        assert_eq!(labels, vec!["prepare", "vm-ready", "join", "report"]);

        let join_script = script_of(&plan, "join");
        assert!(join_script.contains("https://10.0.0.1:6443"));
        assert!(join_script.contains("K10abc::server:xyz"));
        assert!(script_of(&plan, "prepare").contains("'k3s-mac2'"));
        assert_eq!(worker.resource_name(), "k3s-mac2");
    }

    #[test]
    fn test_readiness_checks_exit_1_on_any_failure() {
        // limactl passes through ssh's 255 while the guest sshd boots
        let master = MasterProvisioner::new(renderer(), &HostSpec::new("mac1", "10.0.0.1"));
        let plan = master.create_plan(&());
        assert!(script_of(&plan, "vm-ready").ends_with("|| exit 1"));
        assert!(script_of(&plan, "secrets-ready").ends_with("|| exit 1"));
    }

    #[test]
    fn test_cache_clearing_is_optional() {
        let mut settings = ProvisionSettings::default();
        settings.clear_image_cache = false;
        let worker = WorkerProvisioner::new(
            ScriptRenderer::new(settings),
            &HostSpec::new("mac2", "10.0.0.2"),
        );
        let plan = worker.create_plan(&JoinInfo {
            master_ip: "10.0.0.1".to_string(),
            token: Secret::new("t".to_string()),
        });
        assert!(!script_of(&plan, "prepare").contains("cache delete"));
    }
}
