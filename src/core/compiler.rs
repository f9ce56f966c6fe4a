//! ST-005: Builder graph to flat task list.
//!
//! Packages are built depth-first. Each branch builder is validated, gets its
//! own child [`Package`] whose templates render against that builder's
//! fields, and its tasks are re-added under the branch name with a `.`
//! separator. The result is the flat execution order.

use super::command::{Command, CompiledCommand};
use super::error::CompileError;
use super::schema::{ConfigValidator, Fields, SchemaValidator};
use super::template::{Renderer, DEFAULT_RENDER_ROUNDS};
use crate::events::{Event, EventBus, EventKind};
use std::collections::HashSet;

/// Ordered commands, before compilation.
#[derive(Default)]
pub struct Task {
    commands: Vec<Box<dyn Command>>,
}

impl Task {
    pub fn new() -> Self {
        Self::default()
    }

    /// Task of plain shell templates.
    pub fn from_shell<'a>(lines: impl IntoIterator<Item = &'a str>) -> Self {
        let mut task = Self::new();
        for line in lines {
            task.shell(line);
        }
        task
    }

    pub fn add<C: Command + 'static>(&mut self, command: C) -> &mut Self {
        self.push(Box::new(command))
    }

    pub fn push(&mut self, command: Box<dyn Command>) -> &mut Self {
        self.commands.push(command);
        self
    }

    pub fn shell(&mut self, text: &str) -> &mut Self {
        self.push(text.into())
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// Branch builder: populates a child package. Its fields are the template
/// reference for everything it adds.
pub trait PackageBuilder: Fields {
    fn build(&self, package: &mut Package<'_>) -> Result<(), CompileError>;
}

/// Leaf builder: fills one task.
pub trait TaskBuilder {
    fn build(&self, task: &mut Task) -> Result<(), CompileError>;
}

/// What can be added to a package under a name.
pub enum Unit {
    Task(Task),
    Package(Box<dyn PackageBuilder>),
    Builder(Box<dyn TaskBuilder>),
}

impl Unit {
    pub fn package(builder: impl PackageBuilder + 'static) -> Self {
        Self::Package(Box::new(builder))
    }

    pub fn builder(builder: impl TaskBuilder + 'static) -> Self {
        Self::Builder(Box::new(builder))
    }
}

impl From<Task> for Unit {
    fn from(task: Task) -> Self {
        Self::Task(task)
    }
}

impl From<Box<dyn PackageBuilder>> for Unit {
    fn from(builder: Box<dyn PackageBuilder>) -> Self {
        Self::Package(builder)
    }
}

impl From<Box<dyn TaskBuilder>> for Unit {
    fn from(builder: Box<dyn TaskBuilder>) -> Self {
        Self::Builder(builder)
    }
}

/// A compiled task: unique dotted name and frozen commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledTask {
    pub name: String,
    pub commands: Vec<CompiledCommand>,
}

impl CompiledTask {
    pub fn checksums(&self) -> Vec<String> {
        super::checksum::task_checksums(self)
    }
}

/// Compilation context of one package level.
pub struct Package<'r> {
    reference: &'r dyn Fields,
    validator: &'r dyn ConfigValidator,
    rounds: usize,
    siblings: HashSet<String>,
    full_names: HashSet<String>,
    tasks: Vec<CompiledTask>,
}

impl<'r> Package<'r> {
    fn new(reference: &'r dyn Fields, validator: &'r dyn ConfigValidator, rounds: usize) -> Self {
        Self {
            reference,
            validator,
            rounds,
            siblings: HashSet::new(),
            full_names: HashSet::new(),
            tasks: Vec::new(),
        }
    }

    pub fn reference(&self) -> &'r dyn Fields {
        self.reference
    }

    /// Render a template against this package's reference.
    pub fn render(&self, template: &str) -> Result<String, CompileError> {
        Renderer::new(self.reference, self.rounds)
            .render(template)
            .map_err(|source| CompileError::Render {
                context: template.to_string(),
                source,
            })
    }

    /// Add a unit under `name`. On error the package is left unchanged.
    pub fn add(&mut self, name: &str, unit: impl Into<Unit>) -> Result<(), CompileError> {
        let name = self.render(name)?;
        check_name(&name)?;
        if self.siblings.contains(&name) {
            return Err(CompileError::DuplicateName { name });
        }

        let compiled = match unit.into() {
            Unit::Task(task) => vec![self.compile_task(&name, task)?],
            Unit::Builder(builder) => {
                let mut task = Task::new();
                builder.build(&mut task)?;
                vec![self.compile_task(&name, task)?]
            }
            Unit::Package(builder) => self.expand(&name, builder)?,
        };

        for task in &compiled {
            if self.full_names.contains(&task.name) {
                return Err(CompileError::DuplicateName {
                    name: task.name.clone(),
                });
            }
        }

        log::debug!("added '{}' ({} task(s))", name, compiled.len());
        self.siblings.insert(name);
        for task in compiled {
            self.full_names.insert(task.name.clone());
            self.tasks.push(task);
        }
        Ok(())
    }

    pub fn add_task(&mut self, name: &str, task: Task) -> Result<(), CompileError> {
        self.add(name, task)
    }

    pub fn add_commands<C>(
        &mut self,
        name: &str,
        commands: impl IntoIterator<Item = C>,
    ) -> Result<(), CompileError>
    where
        C: Into<Box<dyn Command>>,
    {
        let mut task = Task::new();
        for command in commands {
            task.push(command.into());
        }
        self.add(name, task)
    }

    pub fn add_package(
        &mut self,
        name: &str,
        builder: impl PackageBuilder + 'static,
    ) -> Result<(), CompileError> {
        self.add(name, Unit::package(builder))
    }

    pub fn add_builder(
        &mut self,
        name: &str,
        builder: impl TaskBuilder + 'static,
    ) -> Result<(), CompileError> {
        self.add(name, Unit::builder(builder))
    }

    pub fn tasks(&self) -> &[CompiledTask] {
        &self.tasks
    }

    fn into_tasks(self) -> Vec<CompiledTask> {
        self.tasks
    }

    fn expand(
        &self,
        name: &str,
        mut builder: Box<dyn PackageBuilder>,
    ) -> Result<Vec<CompiledTask>, CompileError> {
        self.validator
            .validate(&mut *builder)
            .map_err(|source| CompileError::Validation {
                name: name.to_string(),
                source,
            })?;

        let mut child = Package::new(&*builder, self.validator, self.rounds);
        builder.build(&mut child)?;
        Ok(child
            .into_tasks()
            .into_iter()
            .map(|task| CompiledTask {
                name: format!("{name}.{}", task.name),
                commands: task.commands,
            })
            .collect())
    }

    fn compile_task(&self, name: &str, task: Task) -> Result<CompiledTask, CompileError> {
        let renderer = Renderer::new(self.reference, self.rounds);
        let mut commands = Vec::with_capacity(task.len());
        for (index, mut command) in task.commands.into_iter().enumerate() {
            command
                .render(&renderer)
                .map_err(|source| CompileError::Render {
                    context: format!("{name}[{index}]"),
                    source,
                })?;
            let compiled = CompiledCommand::freeze(command.as_ref()).map_err(|source| {
                CompileError::Command {
                    task: name.to_string(),
                    index,
                    source,
                }
            })?;
            commands.push(compiled);
        }
        Ok(CompiledTask {
            name: name.to_string(),
            commands,
        })
    }
}

/// A name is also a remote directory component.
fn check_name(name: &str) -> Result<(), CompileError> {
    let reason = if name.is_empty() {
        "name is empty"
    } else if name.chars().any(char::is_whitespace) {
        "name contains whitespace"
    } else if name.contains('/') {
        "name contains '/'"
    } else if name.starts_with('.') || name.ends_with('.') {
        "name must not start or end with '.'"
    } else {
        return Ok(());
    };
    Err(CompileError::InvalidName {
        name: name.to_string(),
        reason: reason.to_string(),
    })
}

/// Compiles a root builder into the ordered task list.
pub struct Compiler<'b> {
    validator: Box<dyn ConfigValidator>,
    render_rounds: usize,
    bus: Option<&'b EventBus>,
}

impl Default for Compiler<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'b> Compiler<'b> {
    pub fn new() -> Self {
        Self {
            validator: Box::new(SchemaValidator),
            render_rounds: DEFAULT_RENDER_ROUNDS,
            bus: None,
        }
    }

    #[must_use]
    pub fn with_validator(mut self, validator: impl ConfigValidator + 'static) -> Self {
        self.validator = Box::new(validator);
        self
    }

    #[must_use]
    pub fn with_render_rounds(mut self, rounds: usize) -> Self {
        self.render_rounds = rounds;
        self
    }

    #[must_use]
    pub fn with_bus(mut self, bus: &'b EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn compile(&self, root: &mut dyn PackageBuilder) -> Result<Vec<CompiledTask>, CompileError> {
        self.validator
            .validate(&mut *root)
            .map_err(|source| CompileError::Validation {
                name: "root".to_string(),
                source,
            })?;

        let root: &dyn PackageBuilder = root;
        let mut package = Package::new(root, self.validator.as_ref(), self.render_rounds);
        root.build(&mut package)?;
        let tasks = package.into_tasks();

        log::debug!("compiled {} task(s)", tasks.len());
        if let Some(bus) = self.bus {
            for task in &tasks {
                bus.publish(Event::new(
                    None,
                    EventKind::TaskCompiled {
                        task: task.name.clone(),
                        commands: task.commands.len(),
                    },
                ));
            }
        }
        Ok(tasks)
    }
}
