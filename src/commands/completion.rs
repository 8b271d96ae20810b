/// Shell completion scripts built from the clap command tree

use clap::Command;

/// Bash completion for every subcommand and its nested subcommands
pub fn bash(command: &Command) -> String {
    let bin = command.get_name().to_string();
    let top: Vec<&str> = command
        .get_subcommands()
        .map(|c| c.get_name())
        .filter(|name| *name != "help")
        .collect();

    let mut nested = String::new();
    for sub in command.get_subcommands() {
        let children: Vec<&str> = sub
            .get_subcommands()
            .map(|c| c.get_name())
            .filter(|name| *name != "help")
            .collect();
        if !children.is_empty() {
            nested.push_str(&format!(
                "        {})\n            COMPREPLY=( $(compgen -W \"{}\" -- \"$cur\") )\n            return 0\n            ;;\n",
                sub.get_name(),
                children.join(" ")
            ));
        }
    }

    format!(
        r#"# bash completion for {bin}                                -*- shell-script -*-

_{bin}() {{
    local cur="${{COMP_WORDS[COMP_CWORD]}}"

    if [[ $COMP_CWORD -eq 1 ]]; then
        COMPREPLY=( $(compgen -W "{top}" -- "$cur") )
        return 0
    fi

    if [[ $COMP_CWORD -eq 2 ]]; then
        case "${{COMP_WORDS[1]}}" in
{nested}        esac
    fi

    COMPREPLY=( $(compgen -f -- "$cur") )
}}

complete -F _{bin} {bin}
"#,
        bin = bin,
        top = top.join(" "),
        nested = nested,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bash_script_lists_subcommands() {
        let command = Command::new("argosy")
            .subcommand(Command::new("submit"))
            .subcommand(
                Command::new("cron")
                    .subcommand(Command::new("list"))
                    .subcommand(Command::new("suspend")),
            );
        let script = bash(&command);
        assert!(script.contains("bash completion for argosy"));
        assert!(script.contains("compgen -W \"submit cron\""));
        assert!(script.contains("compgen -W \"list suspend\""));
        assert!(script.contains("complete -F _argosy argosy"));
    }
}
